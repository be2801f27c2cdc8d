use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Datelike;
use diagnosis_flow::prompt::{SECTION_TITLES, section_header};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::models::ResearchArticle;

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

/// Literature lookup used by the agent to ground the Research Context section.
#[async_trait]
pub trait LiteratureSearch: Send + Sync {
    async fn search(&self, queries: &[String]) -> anyhow::Result<Vec<ResearchArticle>>;
}

/// NCBI E-utilities over JSON.
pub struct PubMedSearch {
    http: Client,
    years_back: i32,
    max_results: usize,
}

impl PubMedSearch {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            years_back: 3,
            max_results: 10,
        }
    }

    async fn find_ids(&self, term: &str) -> anyhow::Result<Vec<String>> {
        let current_year = chrono::Utc::now().year();
        let url = format!(
            "{}/esearch.fcgi?db=pubmed&term={}&datetype=pdat&mindate={}&maxdate={}&retmax={}&retmode=json",
            EUTILS_BASE,
            urlencoding::encode(term),
            current_year - self.years_back,
            current_year,
            self.max_results
        );
        let body: ESearchResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("PubMed search request failed: {}", e))?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse PubMed search response: {}", e))?;
        Ok(body.esearchresult.idlist)
    }

    async fn summaries(&self, ids: &[String]) -> anyhow::Result<Vec<ResearchArticle>> {
        let url = format!(
            "{}/esummary.fcgi?db=pubmed&id={}&retmode=json",
            EUTILS_BASE,
            ids.join(",")
        );
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("PubMed summary request failed: {}", e))?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse PubMed summary response: {}", e))?;
        parse_summaries(&body)
    }
}

#[async_trait]
impl LiteratureSearch for PubMedSearch {
    async fn search(&self, queries: &[String]) -> anyhow::Result<Vec<ResearchArticle>> {
        for (index, query) in queries.iter().enumerate() {
            info!("PubMed query {} of {}: {}", index + 1, queries.len(), query);
            let ids = self.find_ids(query).await?;
            if ids.is_empty() {
                info!("PubMed query {} returned no articles", index + 1);
                continue;
            }
            return self.summaries(&ids).await;
        }
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Debug, Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DocSummary {
    #[serde(default)]
    title: String,
    #[serde(default)]
    fulljournalname: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    pubdate: Option<String>,
    #[serde(default)]
    authors: Vec<DocAuthor>,
}

#[derive(Debug, Deserialize)]
struct DocAuthor {
    name: String,
}

/// Reads an `esummary` JSON body, keeping the order given by `result.uids`.
pub fn parse_summaries(body: &Value) -> anyhow::Result<Vec<ResearchArticle>> {
    let result = body
        .get("result")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("PubMed summary response has no result object"))?;
    let uids: Vec<String> = result
        .get("uids")
        .map(|v| serde_json::from_value(v.clone()))
        .transpose()?
        .unwrap_or_default();

    let mut articles = Vec::with_capacity(uids.len());
    for uid in uids {
        let Some(entry) = result.get(&uid) else { continue };
        let summary: DocSummary = serde_json::from_value(entry.clone())?;
        if summary.title.trim().is_empty() {
            continue;
        }
        let authors = summary
            .authors
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        articles.push(ResearchArticle {
            pmid: uid,
            title: summary.title.trim().to_string(),
            journal: summary.fulljournalname.or(summary.source),
            publication_date: summary.pubdate,
            authors: (!authors.is_empty()).then_some(authors),
        });
    }
    Ok(articles)
}

pub const QUERY_PREAMBLE: &str =
    "You are a medical research assistant specializing in PubMed literature search.";
pub const RESEARCH_PREAMBLE: &str =
    "You are a medical research analyst specializing in clinical literature review.";

pub fn search_query_prompt(analysis: &str) -> String {
    format!(
        r#"Based on this imaging analysis, write 2 PubMed search queries that would find recent research relevant to the findings.

Rules:
- Put multi-word medical terms in quotation marks
- Use OR between related terms and AND only to combine different concepts
- The first query targets the primary finding, the second is broader

Return only a JSON array of 2 strings.

Imaging analysis:
{}"#,
        analysis
    )
}

pub fn research_section_prompt(analysis: &str, articles: &[ResearchArticle]) -> String {
    let listing = articles
        .iter()
        .map(|a| {
            let mut line = format!("- {} ({})", a.title, a.url());
            if let Some(journal) = &a.journal {
                line.push_str(&format!(", {}", journal));
            }
            if let Some(date) = &a.publication_date {
                line.push_str(&format!(", {}", date));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Write the \"{}\" section for the imaging analysis below. Summarize what the listed recent articles add about similar cases, standard treatment protocols and relevant technological advances. Cite 2-3 of the articles with their links. Return markdown bullet points only, without a section header.\n\nImaging analysis:\n{}\n\nRecent articles:\n{}",
        SECTION_TITLES[4], analysis, listing
    )
}

/// Pulls the JSON string array out of a model reply that may wrap it in prose or code fences.
pub fn parse_query_list(reply: &str) -> anyhow::Result<Vec<String>> {
    let start = reply.find('[');
    let end = reply.rfind(']');
    let candidate = match (start, end) {
        (Some(s), Some(e)) if s < e => &reply[s..=e],
        _ => reply.trim(),
    };
    let queries: Vec<String> = serde_json::from_str(candidate)
        .map_err(|e| anyhow!("Failed to parse search queries: {}", e))?;
    let queries: Vec<String> = queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();
    if queries.is_empty() {
        return Err(anyhow!("Model returned no search queries"));
    }
    Ok(queries)
}

/// Replaces the Research Context section of `analysis` with `research`,
/// appending the section when the model left it out.
pub fn splice_research_section(analysis: &str, research: &str) -> String {
    let body = research
        .trim()
        .lines()
        .skip_while(|line| line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");
    let section = format!("{}\n{}", section_header(4), body.trim());

    let mut offset = 0;
    for line in analysis.split_inclusive('\n') {
        if is_research_header(line) {
            let head = analysis[..offset].trim_end();
            return if head.is_empty() {
                format!("{}\n", section)
            } else {
                format!("{}\n\n{}\n", head, section)
            };
        }
        offset += line.len();
    }

    format!("{}\n\n{}\n", analysis.trim_end(), section)
}

fn is_research_header(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('#') && line.contains(SECTION_TITLES[4])
}

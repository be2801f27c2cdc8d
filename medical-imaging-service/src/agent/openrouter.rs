use anyhow::anyhow;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use diagnosis_flow::{AgentFactory, Credential, FlowError, MedicalAgent};
use reqwest::Client;
use rig::completion::Prompt;
use rig::prelude::*;
use rig::providers::openrouter;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::research::{
    LiteratureSearch, QUERY_PREAMBLE, RESEARCH_PREAMBLE, parse_query_list,
    research_section_prompt, search_query_prompt, splice_research_section,
};

const CHAT_COMPLETIONS_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model_id: String,
    pub max_tokens: u32,
}

/// Medical imaging agent backed by OpenRouter, optionally grounded with a literature search.
pub struct OpenRouterAgent {
    http: Client,
    credential: Credential,
    settings: AgentSettings,
    literature: Option<Arc<dyn LiteratureSearch>>,
}

impl OpenRouterAgent {
    pub fn new(
        http: Client,
        credential: Credential,
        settings: AgentSettings,
        literature: Option<Arc<dyn LiteratureSearch>>,
    ) -> Self {
        Self {
            http,
            credential,
            settings,
            literature,
        }
    }

    /// Single multimodal completion: prompt text followed by every image.
    async fn complete_with_images(&self, prompt: &str, images: &[PathBuf]) -> anyhow::Result<String> {
        let mut content = vec![json!({ "type": "text", "text": prompt })];
        for path in images {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| anyhow!("Failed to read staged image {}: {}", path.display(), e))?;
            content.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{};base64,{}", mime_type(path), STANDARD.encode(&bytes))
                }
            }));
        }

        let payload = json!({
            "model": self.settings.model_id,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": self.settings.max_tokens,
        });

        let response = self
            .http
            .post(CHAT_COMPLETIONS_URL)
            .bearer_auth(self.credential.expose())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!("Model API request failed ({}): {}", status, error_message(&body)));
        }
        message_content(&body)
    }

    /// Text-only prompt through a rig agent.
    async fn prompt_text(&self, preamble: &str, prompt: &str) -> anyhow::Result<String> {
        let client = openrouter::Client::new(self.credential.expose());
        let agent = client
            .agent(&self.settings.model_id)
            .preamble(preamble)
            .max_tokens(self.settings.max_tokens as u64)
            .build();
        Ok(agent.prompt(prompt).await?)
    }

    async fn with_research(
        &self,
        analysis: &str,
        literature: &dyn LiteratureSearch,
    ) -> anyhow::Result<Option<String>> {
        let reply = self
            .prompt_text(QUERY_PREAMBLE, &search_query_prompt(analysis))
            .await?;
        let queries = parse_query_list(&reply)?;
        info!("Generated literature queries: {:?}", queries);

        let articles = match literature.search(&queries).await {
            Ok(articles) => articles,
            Err(e) => {
                warn!("Literature search failed, keeping model research section: {}", e);
                return Ok(None);
            }
        };
        if articles.is_empty() {
            info!("No recent literature found for the generated queries");
            return Ok(None);
        }
        info!("Found {} research articles", articles.len());

        let research = self
            .prompt_text(RESEARCH_PREAMBLE, &research_section_prompt(analysis, &articles))
            .await?;
        Ok(Some(splice_research_section(analysis, &research)))
    }
}

#[async_trait]
impl MedicalAgent for OpenRouterAgent {
    async fn analyze(&self, prompt: &str, images: &[PathBuf]) -> diagnosis_flow::Result<String> {
        info!(
            "Sending {} image(s) to {} for analysis",
            images.len(),
            self.settings.model_id
        );
        let analysis = self
            .complete_with_images(prompt, images)
            .await
            .map_err(|e| FlowError::Agent(e.to_string()))?;
        info!("Model returned analysis ({} characters)", analysis.len());

        let Some(literature) = &self.literature else {
            return Ok(analysis);
        };
        match self.with_research(&analysis, literature.as_ref()).await {
            Ok(Some(enriched)) => Ok(enriched),
            Ok(None) => Ok(analysis),
            Err(e) => {
                warn!("Research step failed, returning analysis as is: {}", e);
                Ok(analysis)
            }
        }
    }

    async fn follow_up(&self, context: &str, question: &str) -> diagnosis_flow::Result<String> {
        info!("Sending follow-up question to {}", self.settings.model_id);
        self.prompt_text(context, question)
            .await
            .map_err(|e| FlowError::Agent(e.to_string()))
    }
}

/// Builds one [`OpenRouterAgent`] per session credential, sharing the HTTP client.
pub struct OpenRouterAgentFactory {
    http: Client,
    settings: AgentSettings,
    literature: Option<Arc<dyn LiteratureSearch>>,
}

impl OpenRouterAgentFactory {
    pub fn new(
        http: Client,
        settings: AgentSettings,
        literature: Option<Arc<dyn LiteratureSearch>>,
    ) -> Self {
        Self {
            http,
            settings,
            literature,
        }
    }
}

impl AgentFactory for OpenRouterAgentFactory {
    fn create(&self, credential: &Credential) -> Arc<dyn MedicalAgent> {
        Arc::new(OpenRouterAgent::new(
            self.http.clone(),
            credential.clone(),
            self.settings.clone(),
            self.literature.clone(),
        ))
    }
}

fn mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/png",
    }
}

fn message_content(body: &Value) -> anyhow::Result<String> {
    match &body["choices"][0]["message"]["content"] {
        Value::String(text) => Ok(text.clone()),
        Value::Array(parts) => Ok(parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("")),
        _ => Err(anyhow!("Invalid response format from model: {}", error_message(body))),
    }
}

fn error_message(body: &Value) -> String {
    body["error"]["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(mime_type(Path::new("/tmp/upload_x.JPG")), "image/jpeg");
        assert_eq!(mime_type(Path::new("/tmp/upload_x.png")), "image/png");
    }

    #[test]
    fn reads_string_and_part_content() {
        let body = json!({"choices": [{"message": {"content": "### 1. Image Type & Region"}}]});
        assert_eq!(message_content(&body).unwrap(), "### 1. Image Type & Region");

        let body = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "A"}, {"type": "text", "text": "B"}
        ]}}]});
        assert_eq!(message_content(&body).unwrap(), "AB");
    }

    #[test]
    fn surfaces_provider_error_message() {
        let body = json!({"error": {"message": "Invalid API key", "code": 401}});
        let err = message_content(&body).unwrap_err();
        assert!(err.to_string().contains("Invalid API key"));
    }

    #[tokio::test]
    async fn unreadable_image_is_an_agent_error() {
        let agent = OpenRouterAgent::new(
            Client::new(),
            Credential::new("key").unwrap(),
            AgentSettings {
                model_id: "test/model".to_string(),
                max_tokens: 10,
            },
            None,
        );
        let missing = PathBuf::from("/definitely/not/here.png");
        let err = agent.analyze("prompt", &[missing]).await.unwrap_err();
        assert!(matches!(err, FlowError::Agent(_)));
    }
}

use diagnosis_flow::{Analysis, ChatEntry, ImageMetadata, ImagePreview};
use serde::{Deserialize, Serialize};

pub const DISCLAIMER: &str =
    "This is an AI-generated report. Always consult a certified medical professional.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchArticle {
    pub pmid: String,
    pub title: String,
    pub journal: Option<String>,
    pub publication_date: Option<String>,
    pub authors: Option<String>,
}

impl ResearchArticle {
    pub fn url(&self) -> String {
        format!("https://pubmed.ncbi.nlm.nih.gov/{}/", self.pmid)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialRequest {
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub question: String,
}

#[derive(Debug, Deserialize)]
pub struct TranscriptQuery {
    pub last: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub credential_configured: bool,
    pub analysis: Option<Analysis>,
    pub transcript: Vec<ChatEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub session_id: String,
    pub images: Vec<ImagePreview>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub session_id: String,
    pub revision: u64,
    pub analysis: String,
    pub images: Vec<ImageMetadata>,
    pub disclaimer: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub question: String,
    pub answer: String,
    pub analysis_revision: Option<u64>,
    pub transcript_len: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscriptResponse {
    pub session_id: String,
    /// Newest first.
    pub entries: Vec<ChatEntry>,
}

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::{context::Credential, error::Result};

/// Remote multimodal model plus whatever search it uses internally.
#[async_trait]
pub trait MedicalAgent: Send + Sync {
    /// Run the analysis prompt against the given local image files.
    async fn analyze(&self, prompt: &str, images: &[PathBuf]) -> Result<String>;

    /// Answer a follow-up question. `context` carries the prior analysis.
    async fn follow_up(&self, context: &str, question: &str) -> Result<String>;
}

/// Builds an agent bound to a session credential.
pub trait AgentFactory: Send + Sync {
    fn create(&self, credential: &Credential) -> Arc<dyn MedicalAgent>;
}

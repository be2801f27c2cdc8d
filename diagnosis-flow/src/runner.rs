//! DiagnosisRunner – loads a session, performs exactly **one** user action against it, and
//! saves it back to storage.
//!
//! Every public method maps to one thing a user can do in the UI: set or reset the API key,
//! preview uploads, analyze images, ask a follow-up question, export the report, or reset.
//! Each call follows the same _load → act → save_ pattern so HTTP handlers stay one-liners.
//!
//! The runner is the only place that builds agents, and it only does so once a credential has
//! been found in the session. Temp copies of uploaded images live exactly as long as the agent
//! call that reads them.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    agent::AgentFactory,
    chat::{ChatPolicy, follow_up_context, validate_question},
    context::{ChatEntry, Credential, SessionSnapshot},
    error::{FlowError, Result},
    prompt::{PromptParams, build_analysis_prompt},
    report::{PageLayout, RenderedReport, write_report},
    storage::{Session, SessionStorage},
    upload::{self, ImageMetadata, ImagePreview, PREVIEW_WIDTH, UploadedImage},
};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Directory for staged images and rendered reports.
    pub temp_dir: PathBuf,
    pub chat_policy: ChatPolicy,
    pub layout: PageLayout,
    pub preview_width: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            chat_policy: ChatPolicy::default(),
            layout: PageLayout::default(),
            preview_width: PREVIEW_WIDTH,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub revision: u64,
    pub analysis: String,
    pub images: Vec<ImageMetadata>,
}

#[derive(Debug, Clone)]
pub struct FollowUpOutcome {
    pub question: String,
    pub answer: String,
    pub analysis_revision: Option<u64>,
    pub transcript_len: usize,
}

/// High-level helper that orchestrates the _load → act → save_ pattern for each user action.
#[derive(Clone)]
pub struct DiagnosisRunner {
    storage: Arc<dyn SessionStorage>,
    agents: Arc<dyn AgentFactory>,
    settings: RunnerSettings,
}

impl DiagnosisRunner {
    pub fn new(
        storage: Arc<dyn SessionStorage>,
        agents: Arc<dyn AgentFactory>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            storage,
            agents,
            settings,
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub async fn start_session(&self) -> Result<Session> {
        let session = Session::new();
        self.storage.save(session.clone()).await?;
        info!("Session {} started", session.id);
        Ok(session)
    }

    pub async fn load(&self, session_id: &str) -> Result<Session> {
        self.storage
            .get(session_id)
            .await?
            .ok_or_else(|| FlowError::SessionNotFound(session_id.to_string()))
    }

    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        self.load(session_id).await?;
        self.storage.delete(session_id).await?;
        info!("Session {} ended", session_id);
        Ok(())
    }

    pub async fn set_credential(&self, session_id: &str, api_key: &str) -> Result<()> {
        let credential = Credential::new(api_key)
            .ok_or_else(|| FlowError::InvalidInput("API key cannot be empty".to_string()))?;
        let session = self.load(session_id).await?;
        session.context.set_credential(credential).await;
        self.storage.save(session).await?;
        info!("API key configured for session {}", session_id);
        Ok(())
    }

    pub async fn clear_credential(&self, session_id: &str) -> Result<()> {
        let session = self.load(session_id).await?;
        session.context.clear_credential().await;
        self.storage.save(session).await?;
        info!("API key reset for session {}", session_id);
        Ok(())
    }

    /// Forgets the analysis and the transcript; the credential is kept.
    pub async fn reset(&self, session_id: &str) -> Result<()> {
        let session = self.load(session_id).await?;
        session.context.reset_analysis().await;
        self.storage.save(session).await
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        let session = self.load(session_id).await?;
        Ok(session.context.snapshot().await)
    }

    pub async fn transcript(&self, session_id: &str, last: Option<usize>) -> Result<Vec<ChatEntry>> {
        let session = self.load(session_id).await?;
        Ok(session.context.recent_entries(last).await)
    }

    /// Decodes the uploads for display. Never calls the agent.
    pub async fn preview_images(&self, uploads: Vec<UploadedImage>) -> Result<Vec<ImagePreview>> {
        if uploads.is_empty() {
            return Err(FlowError::InvalidInput(
                "Please upload medical images to proceed".to_string(),
            ));
        }
        let max_width = self.settings.preview_width;
        tokio::task::spawn_blocking(move || {
            uploads
                .iter()
                .map(|u| upload::preview(u, max_width))
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| FlowError::Io(std::io::Error::other(e)))?
    }

    pub async fn analyze(
        &self,
        session_id: &str,
        uploads: Vec<UploadedImage>,
        params: PromptParams,
    ) -> Result<AnalysisOutcome> {
        let session = self.load(session_id).await?;
        let credential = session
            .context
            .credential()
            .await
            .ok_or(FlowError::MissingCredential)?;

        if uploads.is_empty() {
            return Err(FlowError::InvalidInput(
                "Please upload medical images to proceed".to_string(),
            ));
        }

        let temp_dir = self.settings.temp_dir.clone();
        let (images, staged) = tokio::task::spawn_blocking(move || {
            let images = uploads
                .iter()
                .map(upload::inspect)
                .collect::<Result<Vec<_>>>()?;
            let staged = upload::stage(&uploads, &temp_dir)?;
            Ok::<_, FlowError>((images, staged))
        })
        .await
        .map_err(|e| FlowError::Io(std::io::Error::other(e)))??;

        let prompt = build_analysis_prompt(&params);
        let agent = self.agents.create(&credential);

        info!(
            "Analyzing {} image(s) for session {}",
            staged.len(),
            session_id
        );
        let result = agent.analyze(&prompt, &staged.paths()).await;
        drop(staged);

        let analysis = result.inspect_err(|e| warn!("Analysis failed for session {}: {}", session_id, e))?;
        if analysis.trim().is_empty() {
            return Err(FlowError::Agent("Model returned an empty analysis".to_string()));
        }

        let revision = session
            .context
            .set_analysis(analysis.clone())
            .await
            .ok_or_else(|| ended_during_call(session_id))?;
        self.storage.save(session).await?;
        info!(
            "Analysis revision {} stored for session {} ({} characters)",
            revision,
            session_id,
            analysis.len()
        );

        Ok(AnalysisOutcome {
            revision,
            analysis,
            images,
        })
    }

    pub async fn follow_up(&self, session_id: &str, question: &str) -> Result<FollowUpOutcome> {
        let question = validate_question(question)?.to_string();
        let session = self.load(session_id).await?;
        let credential = session
            .context
            .credential()
            .await
            .ok_or(FlowError::MissingCredential)?;

        let (analysis_text, analysis_revision) =
            match (session.context.analysis().await, self.settings.chat_policy) {
                (Some(analysis), _) => (analysis.text, Some(analysis.revision)),
                (None, ChatPolicy::AllowEmptyContext) => (String::new(), None),
                (None, ChatPolicy::RejectWithoutAnalysis) => return Err(FlowError::NoAnalysis),
            };

        let agent = self.agents.create(&credential);
        let answer = agent
            .follow_up(&follow_up_context(&analysis_text), &question)
            .await
            .inspect_err(|e| warn!("Follow-up failed for session {}: {}", session_id, e))?;

        if !session
            .context
            .record_exchange(question.clone(), answer.clone(), analysis_revision)
            .await
        {
            return Err(ended_during_call(session_id));
        }
        let transcript_len = session.context.transcript_len().await;
        self.storage.save(session).await?;

        Ok(FollowUpOutcome {
            question,
            answer,
            analysis_revision,
            transcript_len,
        })
    }

    pub async fn export_report(&self, session_id: &str) -> Result<RenderedReport> {
        let session = self.load(session_id).await?;
        let analysis = session
            .context
            .analysis()
            .await
            .ok_or(FlowError::NoAnalysis)?;

        let layout = self.settings.layout;
        let temp_dir = self.settings.temp_dir.clone();
        tokio::task::spawn_blocking(move || write_report(&analysis.text, &layout, &temp_dir))
            .await
            .map_err(|e| FlowError::Io(std::io::Error::other(e)))?
    }
}

/// The session was ended while its agent call was in flight; the result is discarded.
fn ended_during_call(session_id: &str) -> FlowError {
    warn!("Session {} ended during agent call, discarding result", session_id);
    FlowError::SessionNotFound(session_id.to_string())
}

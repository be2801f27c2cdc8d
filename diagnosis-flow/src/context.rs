use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// API key supplied by the user for one session. Never serialized, never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Returns `None` for blank input so an empty form field never counts as configured.
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into().trim().to_string();
        if key.is_empty() { None } else { Some(Self(key)) }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(****)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// One side of a follow-up exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub speaker: Speaker,
    pub text: String,
    /// Revision of the analysis that was current when the question was asked.
    pub analysis_revision: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// The markdown report produced by one analysis call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub revision: u64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub credential_configured: bool,
    pub analysis: Option<Analysis>,
    pub transcript: Vec<ChatEntry>,
}

#[derive(Debug, Default)]
struct SessionState {
    credential: Option<Credential>,
    analysis: Option<Analysis>,
    last_revision: u64,
    transcript: Vec<ChatEntry>,
    closed: bool,
}

/// Mutable state of one interactive session, shared by every handler that touches it.
#[derive(Clone, Debug, Default)]
pub struct SessionContext {
    state: Arc<RwLock<SessionState>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_credential(&self, credential: Credential) {
        self.state.write().await.credential = Some(credential);
    }

    pub async fn clear_credential(&self) {
        self.state.write().await.credential = None;
    }

    pub async fn credential(&self) -> Option<Credential> {
        self.state.read().await.credential.clone()
    }

    /// Replaces the current analysis and returns its revision, or `None` once the
    /// session has been closed.
    pub async fn set_analysis(&self, text: impl Into<String>) -> Option<u64> {
        let mut state = self.state.write().await;
        if state.closed {
            return None;
        }
        state.last_revision += 1;
        let revision = state.last_revision;
        state.analysis = Some(Analysis {
            revision,
            text: text.into(),
            created_at: Utc::now(),
        });
        Some(revision)
    }

    pub async fn analysis(&self) -> Option<Analysis> {
        self.state.read().await.analysis.clone()
    }

    /// Appends the question and the answer as two consecutive entries.
    /// Returns `false` without recording anything once the session has been closed.
    pub async fn record_exchange(
        &self,
        question: impl Into<String>,
        answer: impl Into<String>,
        analysis_revision: Option<u64>,
    ) -> bool {
        let now = Utc::now();
        let mut state = self.state.write().await;
        if state.closed {
            return false;
        }
        state.transcript.push(ChatEntry {
            speaker: Speaker::User,
            text: question.into(),
            analysis_revision,
            timestamp: now,
        });
        state.transcript.push(ChatEntry {
            speaker: Speaker::Assistant,
            text: answer.into(),
            analysis_revision,
            timestamp: now,
        });
        true
    }

    pub async fn transcript(&self) -> Vec<ChatEntry> {
        self.state.read().await.transcript.clone()
    }

    pub async fn transcript_len(&self) -> usize {
        self.state.read().await.transcript.len()
    }

    /// Most recent entries first, optionally capped at `limit`.
    pub async fn recent_entries(&self, limit: Option<usize>) -> Vec<ChatEntry> {
        let state = self.state.read().await;
        let take = limit.unwrap_or(state.transcript.len());
        state.transcript.iter().rev().take(take).cloned().collect()
    }

    /// Drops the analysis and the transcript. The credential stays.
    pub async fn reset_analysis(&self) {
        let mut state = self.state.write().await;
        state.analysis = None;
        state.transcript.clear();
    }

    /// Drops everything, credential included, and refuses later writes.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.credential = None;
        state.analysis = None;
        state.transcript.clear();
        state.closed = true;
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read().await;
        SessionSnapshot {
            credential_configured: state.credential.is_some(),
            analysis: state.analysis.clone(),
            transcript: state.transcript.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_credential_is_rejected() {
        assert!(Credential::new("   ").is_none());
        assert_eq!(Credential::new(" key ").unwrap().expose(), "key");
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::new("sk-secret").unwrap();
        assert!(!format!("{:?}", credential).contains("sk-secret"));
    }

    #[tokio::test]
    async fn analysis_revisions_increase() {
        let context = SessionContext::new();
        assert_eq!(context.set_analysis("first").await, Some(1));
        assert_eq!(context.set_analysis("second").await, Some(2));
        assert_eq!(context.analysis().await.unwrap().text, "second");

        context.reset_analysis().await;
        assert!(context.analysis().await.is_none());
        assert_eq!(context.set_analysis("third").await, Some(3));
    }

    #[tokio::test]
    async fn recent_entries_are_newest_first() {
        let context = SessionContext::new();
        context.record_exchange("q1", "a1", Some(1)).await;
        context.record_exchange("q2", "a2", Some(1)).await;

        let recent = context.recent_entries(Some(3)).await;
        let texts: Vec<_> = recent.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["a2", "q2", "a1"]);
        assert_eq!(recent[0].speaker, Speaker::Assistant);
        assert_eq!(context.recent_entries(None).await.len(), 4);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let context = SessionContext::new();
        let handle = context.clone();
        handle.set_credential(Credential::new("key").unwrap()).await;
        assert!(context.snapshot().await.credential_configured);

        context.clear().await;
        assert!(handle.credential().await.is_none());
    }

    #[tokio::test]
    async fn cleared_context_refuses_late_writes() {
        let context = SessionContext::new();
        context.clear().await;

        assert!(context.is_closed().await);
        assert_eq!(context.set_analysis("late").await, None);
        assert!(!context.record_exchange("q", "a", None).await);

        let snapshot = context.snapshot().await;
        assert!(snapshot.analysis.is_none());
        assert!(snapshot.transcript.is_empty());
    }
}

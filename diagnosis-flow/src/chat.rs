use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{FlowError, Result};

/// What to do with a follow-up question when no analysis exists yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChatPolicy {
    /// Refuse the question.
    #[default]
    RejectWithoutAnalysis,
    /// Ask the model anyway, with an empty analysis in the context.
    AllowEmptyContext,
}

impl FromStr for ChatPolicy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" | "reject-without-analysis" => Ok(ChatPolicy::RejectWithoutAnalysis),
            "empty-context" | "allow-empty-context" => Ok(ChatPolicy::AllowEmptyContext),
            other => Err(format!(
                "unknown chat policy '{}', expected 'reject' or 'empty-context'",
                other
            )),
        }
    }
}

/// Context handed to the agent alongside the question.
pub fn follow_up_context(analysis: &str) -> String {
    format!(
        "You are a medical assistant. The user has received the following analysis:\n\n{}",
        analysis
    )
}

/// Returns the trimmed question, rejecting blank input.
pub fn validate_question(question: &str) -> Result<&str> {
    let question = question.trim();
    if question.is_empty() {
        return Err(FlowError::InvalidInput("Please enter a question".to_string()));
    }
    Ok(question)
}

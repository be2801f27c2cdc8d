use thiserror::Error;

/// Errors produced by the diagnosis pipeline.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("No API key configured for this session")]
    MissingCredential,

    #[error("No analysis available. Please analyze an image first")]
    NoAnalysis,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported image {file_name}: {reason}")]
    UnsupportedImage { file_name: String, reason: String },

    #[error("Agent call failed: {0}")]
    Agent(String),

    #[error("Report generation failed: {0}")]
    Report(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers to decide how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing credential or missing prerequisite state.
    Configuration,
    /// Bad request data supplied by the user.
    Input,
    /// Transport, auth or provider-side failure.
    Remote,
    /// Temp file or rendering failure on this host.
    LocalIo,
    NotFound,
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::MissingCredential | FlowError::NoAnalysis => ErrorKind::Configuration,
            FlowError::InvalidInput(_) | FlowError::UnsupportedImage { .. } => ErrorKind::Input,
            FlowError::Agent(_) => ErrorKind::Remote,
            FlowError::Report(_) | FlowError::Io(_) => ErrorKind::LocalIo,
            FlowError::SessionNotFound(_) => ErrorKind::NotFound,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

pub mod agent;
pub mod chat;
pub mod context;
pub mod error;
pub mod prompt;
pub mod report;
pub mod runner;
pub mod storage;
pub mod upload;

// Re-export commonly used types
pub use agent::{AgentFactory, MedicalAgent};
pub use chat::ChatPolicy;
pub use context::{Analysis, ChatEntry, Credential, SessionContext, SessionSnapshot, Speaker};
pub use error::{ErrorKind, FlowError, Result};
pub use prompt::{PromptParams, SECTION_TITLES, build_analysis_prompt};
pub use report::{PageLayout, REPORT_FILE_NAME, RenderedReport};
pub use runner::{AnalysisOutcome, DiagnosisRunner, FollowUpOutcome, RunnerSettings};
pub use storage::{InMemorySessionStorage, Session, SessionStorage};
pub use upload::{ImageMetadata, ImagePreview, UploadedImage};

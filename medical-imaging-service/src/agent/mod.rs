pub mod openrouter;
pub mod research;

pub use openrouter::{AgentSettings, OpenRouterAgent, OpenRouterAgentFactory};
pub use research::{LiteratureSearch, PubMedSearch};

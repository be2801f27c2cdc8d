pub mod agent;
pub mod config;
pub mod models;
pub mod service;

pub use config::{ConfigError, ServiceConfig};
pub use service::{AppState, build_router, create_app};

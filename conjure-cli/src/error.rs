//! CLI errors.

use conjure_core::{ConfigError, ConjureError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Conjure(#[from] ConjureError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid store URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to render report: {0}")]
    Render(#[from] serde_json::Error),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Failed to wait for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

pub type CliResult<T> = Result<T, CliError>;

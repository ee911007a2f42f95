use std::path::PathBuf;

use crate::ai::AiError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("clone error: {0}")]
    Clone(String),

    #[error("scanner error: {0}")]
    Scanner(String),

    #[error(transparent)]
    Ai(#[from] AiError),

    #[error("fixer error: {0}")]
    Fixer(String),

    #[error("patch error: {0}")]
    Patch(String),

    #[error("pr error: {0}")]
    Pr(String),

    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Cancellation must propagate as-is, never converted into a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::vcpu::DecodeError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Assembly error at line {line}: {message}")]
    Assembly { line: usize, message: String },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Submission not found: {0}")]
    SubmissionNotFound(crate::core::SubmissionId),

    #[error("Coordinator is not running")]
    CoordinatorUnavailable,
}

pub type Result<T> = std::result::Result<T, Error>;

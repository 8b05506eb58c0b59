//! Worker errors.

use std::path::PathBuf;

use thiserror::Error;
use transformer_core::CoreError;
use transformer_runtime::{EngineError, RuntimeError, SecretsError};

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The configured secrets key is unusable.
    #[error("invalid secret key configuration: {0}")]
    SecretKey(#[source] SecretsError),

    #[error("failed to read task file {}: {source}", path.display())]
    TaskFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse task file {}: {source}", path.display())]
    TaskParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// An output contract could not be finalized.
    #[error(transparent)]
    Result(#[from] CoreError),

    #[error("cleanup failed: {0}")]
    Cleanup(#[from] EngineError),
}

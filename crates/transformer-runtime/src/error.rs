//! Error types for the transformer runtime.

use std::path::PathBuf;

use thiserror::Error;
use transformer_core::CoreError;

/// Errors from the container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine executable not found.
    #[error("container engine not found at '{0}'")]
    NotFound(String),

    /// Failed to talk to the engine.
    #[error("failed to invoke container engine: {0}")]
    Io(#[from] std::io::Error),

    /// An engine command reported failure.
    #[error("container engine command failed: {0}")]
    Command(String),

    /// The container could not be started.
    #[error("failed to launch container: {0}")]
    Launch(String),
}

/// Errors from secrets decryption.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// The configured key could not be parsed.
    #[error("invalid secrets key: {0}")]
    InvalidKey(String),

    /// A leaf could not be decrypted.
    #[error("Error during decryption (probably incorrect key). Original error: {0}")]
    Decrypt(String),
}

/// Errors reading an output manifest from disk.
#[derive(Debug, Error)]
pub enum ManifestReadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

impl ManifestReadError {
    /// Returns true if the manifest file does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Errors that can occur while running a transformer.
///
/// Only `Workspace`, `NotADirectory`, `InputManifest`, `Secrets` and `Report`
/// ever reach the caller of `run_transformer`; everything else is turned into
/// an error result.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Filesystem setup failed.
    #[error("workspace error at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A workspace path exists but is not a directory.
    #[error("workspace error: {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// The input manifest could not be encoded.
    #[error("failed to encode input manifest: {0}")]
    InputManifest(#[source] serde_json::Error),

    /// Secrets could not be decrypted.
    #[error(transparent)]
    Secrets(#[from] SecretsError),

    /// The container engine failed to create or run something.
    #[error(transparent)]
    Launch(#[from] EngineError),

    /// The transformer exited with a non-zero code.
    #[error("exit-code {0}")]
    ExitCode(i64),

    /// The output manifest was absent or unparsable.
    #[error("Could not load output manifest: {source}")]
    ManifestMissing {
        #[source]
        source: ManifestReadError,
    },

    /// The output manifest is structurally invalid.
    #[error("Output manifest validation error: {0}")]
    ManifestValidation(String),

    /// A partial output manifest could not be read while reporting a failure.
    #[error("failed to read partial output manifest while reporting '{primary}': {source}")]
    Report {
        primary: String,
        #[source]
        source: ManifestReadError,
    },
}

impl RuntimeError {
    /// Error code carried into error results, if the error has one.
    pub fn code(&self) -> Option<String> {
        match self {
            Self::ExitCode(code) => Some(code.to_string()),
            _ => None,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::ManifestValidation(message.into())
    }
}

/// Errors from the contract store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("contract not found: {0}")]
    NotFound(String),

    #[error("contract store unavailable: {0}")]
    Unavailable(String),
}

/// Errors during backflow propagation.
#[derive(Debug, Error)]
pub enum BackflowError {
    /// A formula could not be evaluated.
    #[error("Formula eval error: {0}")]
    Formula(String),

    /// An upstream path could not be resolved or applied.
    #[error("invalid upstream path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// The contract no longer deserializes after applying a mapping.
    #[error("invalid contract after backflow: {0}")]
    Contract(#[from] serde_json::Error),
}

//! Core domain errors.

use thiserror::Error;

/// Core domain errors for the transformer runtime.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A result entry could not be interpreted as any known result kind.
    #[error("invalid result: {0}")]
    InvalidResult(String),

    /// A result declared more than one artifact delivery mode.
    #[error("result {slug} contained multiple kinds of artifact")]
    MultipleDeliveryModes { slug: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

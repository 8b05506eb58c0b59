//! Container engine abstraction.
//!
//! The runtime never talks to a container engine directly; it goes through
//! [`ContainerEngine`], so it can be driven by the Docker CLI in production
//! and by a fake in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::EngineError;

/// Label carrying the run identity.
pub const RUN_LABEL: &str = "io.transformer-runtime.run";

/// Label marking a resource as created by the transformer runtime.
pub const TRANSFORMER_LABEL: &str = "io.transformer-runtime.transformer";

/// Resource labels, ordered for stable command lines.
pub type Labels = BTreeMap<String, String>;

/// An attached output stream of a running container.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Resolves to the container's exit code once it stops.
pub type ExitFuture = Pin<Box<dyn Future<Output = Result<i64, EngineError>> + Send>>;

/// A filesystem mount into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host path or volume name.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    /// Bind-mount a host path.
    pub fn bind(source: &Path, target: impl Into<String>, read_only: bool) -> Self {
        Self {
            source: source.display().to_string(),
            target: target.into(),
            read_only,
        }
    }

    /// Mount a named volume read-write.
    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: name.into(),
            target: target.into(),
            read_only: false,
        }
    }

    /// `source:target[:ro]` form used by `docker run -v`.
    pub fn to_bind_spec(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Everything needed to launch one transformer container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub labels: Labels,
    pub privileged: bool,
    /// Run an init process as PID 1 so no zombies are left behind.
    pub init: bool,
}

/// A launched container with its output attached.
pub struct AttachedContainer {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub exit: ExitFuture,
}

/// `key=value` label filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    pub key: String,
    pub value: String,
}

impl LabelFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Returns true if `labels` carry this label with this value.
    pub fn matches(&self, labels: &Labels) -> bool {
        labels.get(&self.key) == Some(&self.value)
    }
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Operations the runtime needs from a container engine.
///
/// Implementations must be safe to share between concurrent runs; runs are
/// kept apart by labels only.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a named volume.
    async fn create_volume(&self, name: &str, labels: &Labels) -> Result<(), EngineError>;

    /// Start a container without a TTY and attach its stdout and stderr.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<AttachedContainer, EngineError>;

    /// Ids of all containers (running or not) matching `filter`.
    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<String>, EngineError>;

    /// Force-remove a container. A container that is already gone is not an error.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Names of all volumes matching `filter`.
    async fn list_volumes(&self, filter: &LabelFilter) -> Result<Vec<String>, EngineError>;

    /// Force-remove a volume. A volume that is already gone is not an error.
    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;
}

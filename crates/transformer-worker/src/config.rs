//! Worker configuration.

use std::path::PathBuf;

use clap::Args;
use transformer_core::{ArtifactReference, TaskContract};
use transformer_runtime::SecretsDecryptor;

use crate::error::WorkerError;

const DEFAULT_INPUT_ROOT: &str = "/tmp/transformer/input";
const DEFAULT_OUTPUT_ROOT: &str = "/tmp/transformer/output";
const DEFAULT_REGISTRY_HOST: &str = "localhost";
const DEFAULT_DOCKER_PATH: &str = "docker";

/// Worker configuration.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Root of the per-task input directories
    #[arg(long, env = "TRANSFORMER_INPUT_DIR", default_value = DEFAULT_INPUT_ROOT)]
    pub input_root: PathBuf,

    /// Root of the per-task output directories
    #[arg(long, env = "TRANSFORMER_OUTPUT_DIR", default_value = DEFAULT_OUTPUT_ROOT)]
    pub output_root: PathBuf,

    /// Base64-encoded PEM private key for secrets decryption
    #[arg(long, env = "TRANSFORMER_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Registry host transformer images are pulled from
    #[arg(long, env = "REGISTRY_HOST", default_value = DEFAULT_REGISTRY_HOST)]
    pub registry_host: String,

    /// Registry port
    #[arg(long, env = "REGISTRY_PORT")]
    pub registry_port: Option<u16>,

    /// Path to the docker executable
    #[arg(long, env = "DOCKER_PATH", default_value = DEFAULT_DOCKER_PATH)]
    pub docker_path: String,

    /// Run transformer containers privileged
    #[arg(long, env = "TRANSFORMER_PRIVILEGED")]
    pub privileged: bool,

    /// Emit JSON events on stdout
    #[arg(long)]
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from(DEFAULT_INPUT_ROOT),
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
            secret_key: None,
            registry_host: DEFAULT_REGISTRY_HOST.to_string(),
            registry_port: None,
            docker_path: DEFAULT_DOCKER_PATH.to_string(),
            privileged: false,
            json: false,
        }
    }
}

/// Host directories of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDirectories {
    /// Working directory; holds the input manifest.
    pub input: PathBuf,
    /// Directory holding the primary input artifact.
    pub artifact: PathBuf,
    pub output: PathBuf,
}

impl Config {
    /// Directories for `task`, keyed by its identity.
    pub fn task_directories(&self, task: &TaskContract) -> TaskDirectories {
        let name = task.directory_name();
        let input = self.input_root.join(&name);
        TaskDirectories {
            artifact: input.join("artifact"),
            input,
            output: self.output_root.join(&name),
        }
    }

    /// Image reference of the task's transformer.
    pub fn transformer_image(&self, task: &TaskContract) -> String {
        ArtifactReference::for_contract(&self.registry_host, self.registry_port, &task.data.transformer)
            .to_string()
    }

    /// Secrets decryptor for the configured key.
    pub fn decryptor(&self) -> Result<SecretsDecryptor, WorkerError> {
        let decryptor = SecretsDecryptor::from_base64_pem(self.secret_key.as_deref())
            .map_err(WorkerError::SecretKey)?;
        Ok(decryptor)
    }
}

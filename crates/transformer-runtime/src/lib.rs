//! Transformer Runtime
//!
//! This crate runs a single transformer image over a single input artifact
//! and turns whatever happens into an [`OutputManifest`]:
//!
//! 1. the workspace is prepared and the input manifest written,
//! 2. the image runs with its inputs bind-mounted and its output streamed,
//! 3. the output manifest is validated, or the failure is reported as an
//!    `error@1.0.0` result,
//! 4. every container and volume labeled with the run identity is removed.
//!
//! Once results are stored upstream, [`BackflowPropagator`] threads result
//! values back up the contract chain.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use transformer_runtime::{DockerCli, SecretsDecryptor, TransformRequest, TransformerRuntime};
//! use transformer_core::{ArtifactContract, TransformerContract};
//!
//! async fn run(
//!     input: ArtifactContract,
//!     transformer: TransformerContract,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = TransformerRuntime::new(
//!         Arc::new(DockerCli::default()),
//!         SecretsDecryptor::passthrough(),
//!     );
//!
//!     let request = TransformRequest::new(
//!         input,
//!         transformer,
//!         "registry.local/transformer-build:1.0.0",
//!         "/tmp/artifact",
//!         "/tmp/work",
//!         "/tmp/output",
//!     );
//!
//!     let manifest = runtime.run_transformer(&request).await?;
//!     println!("error: {}", manifest.is_error());
//!     Ok(())
//! }
//! ```

mod backflow;
mod docker;
mod engine;
mod error;
mod manifest;
mod report;
mod runtime;
mod scope;
mod secrets;
mod tail;
mod validate;
mod workspace;

pub use backflow::{
    BackflowPropagator, BackflowReport, ContractStore, FormulaEvaluator, PathFormulaEvaluator,
    UpstreamLink, BACKFLOW_LIMIT,
};
pub use docker::DockerCli;
pub use engine::{
    AttachedContainer, ContainerEngine, ContainerSpec, ExitFuture, LabelFilter, Labels, Mount,
    OutputStream, RUN_LABEL, TRANSFORMER_LABEL,
};
pub use error::{
    BackflowError, EngineError, ManifestReadError, RuntimeError, SecretsError, StoreError,
};
pub use manifest::{read_output_manifest, write_input_manifest};
pub use report::ErrorReporter;
pub use runtime::{SecondaryInput, TransformRequest, TransformerRuntime};
pub use scope::{cleanup_run, CleanupSummary, RunScope};
pub use secrets::SecretsDecryptor;
pub use tail::{CapturedLogs, LogTail, StreamKind, TAIL_LINES};
pub use validate::{create_output_manifest, validate_output_manifest};
pub use workspace::Workspace;

pub use transformer_core::OutputManifest;

//! Conversion of run failures into `error@1.0.0` results.

use std::path::Path;

use chrono::Utc;
use serde_json::Map;
use tracing::{error, warn};
use transformer_core::{
    ArtifactContract, ErrorContract, ErrorData, OutputManifest, TransformerContract,
    ERROR_CONTRACT_TYPE,
};

use crate::error::RuntimeError;
use crate::manifest::read_output_manifest;
use crate::tail::CapturedLogs;

const ERROR_CONTRACT_NAME: &str = "Transformer Runtime Error";
const ERROR_CONTRACT_VERSION: &str = "1.0.0";

/// Fallback code for failures without an exit code.
const DEFAULT_ERROR_CODE: &str = "1";

/// Builds the error result of a failed run.
pub struct ErrorReporter<'a> {
    input: &'a ArtifactContract,
    transformer: &'a TransformerContract,
    output_dir: &'a Path,
}

impl<'a> ErrorReporter<'a> {
    pub fn new(
        input: &'a ArtifactContract,
        transformer: &'a TransformerContract,
        output_dir: &'a Path,
    ) -> Self {
        Self {
            input,
            transformer,
            output_dir,
        }
    }

    /// Describe `failure` as a single-result manifest.
    ///
    /// A partial output manifest left by the transformer is attached. Its
    /// absence is expected; any other failure to read it is returned as
    /// [`RuntimeError::Report`].
    pub async fn report(
        &self,
        failure: &RuntimeError,
        logs: &CapturedLogs,
    ) -> Result<OutputManifest, RuntimeError> {
        error!(
            input = %self.input.slug,
            transformer = %self.transformer.versioned_slug(),
            error = %failure,
            "Transformer run failed"
        );

        let output_manifest = match read_output_manifest(self.output_dir).await {
            Ok(manifest) => {
                warn!("Attaching partial output manifest to error result");
                Some(manifest)
            }
            Err(e) if e.is_not_found() => None,
            Err(source) => {
                return Err(RuntimeError::Report {
                    primary: failure.to_string(),
                    source,
                })
            }
        };

        let data = ErrorData {
            message: failure.to_string(),
            code: failure
                .code()
                .unwrap_or_else(|| DEFAULT_ERROR_CODE.to_string()),
            transformer: Some(self.transformer.versioned_slug()),
            expected_output_types: self.transformer.data.expected_output_types.clone(),
            std_out_tail: logs.stdout.joined(),
            std_err_tail: logs.stderr.joined(),
            output_manifest,
            extra: Map::new(),
        };

        Ok(OutputManifest::from_error(ErrorContract {
            id: None,
            slug: format!("error-{}-{}", self.input.slug, Utc::now().timestamp_millis()),
            version: ERROR_CONTRACT_VERSION.to_string(),
            contract_type: ERROR_CONTRACT_TYPE.to_string(),
            name: Some(ERROR_CONTRACT_NAME.to_string()),
            data,
            extra: Map::new(),
        }))
    }
}

//! Output manifest validation.

use std::path::{Component, Path};

use serde_json::Value;
use tracing::{debug, info};
use transformer_core::OutputManifest;

use crate::error::RuntimeError;
use crate::manifest::read_output_manifest;

/// Turn a finished container's exit code and output directory into a
/// validated manifest.
///
/// A non-zero exit code fails without looking at the output directory.
pub async fn create_output_manifest(
    exit_code: i64,
    output_dir: &Path,
) -> Result<OutputManifest, RuntimeError> {
    if exit_code != 0 {
        return Err(RuntimeError::ExitCode(exit_code));
    }

    let raw = read_output_manifest(output_dir)
        .await
        .map_err(|source| RuntimeError::ManifestMissing { source })?;

    let mut manifest = validate_output_manifest(raw, output_dir).await?;
    manifest.exit_code = Some(exit_code);
    Ok(manifest)
}

/// Structurally validate a parsed output manifest.
pub async fn validate_output_manifest(
    raw: Value,
    output_dir: &Path,
) -> Result<OutputManifest, RuntimeError> {
    let results = raw
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| RuntimeError::validation("missing results array"))?;

    if results.is_empty() {
        info!("Transformer produced no results");
    }

    for (index, result) in results.iter().enumerate() {
        let has_data = result
            .get("contract")
            .and_then(|contract| contract.get("data"))
            .and_then(Value::as_object)
            .is_some_and(|data| !data.is_empty());
        if !has_data {
            return Err(RuntimeError::validation(format!(
                "missing result contract (result {})",
                index
            )));
        }

        if let Some(path) = result.get("artifactPath").and_then(Value::as_str) {
            if !path.is_empty() {
                check_artifact_path(path, output_dir).await?;
            }
        }
    }

    let manifest: OutputManifest =
        serde_json::from_value(raw).map_err(|e| RuntimeError::validation(e.to_string()))?;
    debug!(results = manifest.results.len(), "Validated output manifest");
    Ok(manifest)
}

async fn check_artifact_path(path: &str, output_dir: &Path) -> Result<(), RuntimeError> {
    let relative = Path::new(path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(RuntimeError::validation(format!(
            "artifact path {} must stay inside the output directory",
            path
        )));
    }

    let full = output_dir.join(relative);
    if !is_readable(&full).await {
        return Err(RuntimeError::validation(format!(
            "artifact path {} is not readable",
            path
        )));
    }
    Ok(())
}

async fn is_readable(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::read_dir(path).await.is_ok(),
        Ok(_) => tokio::fs::File::open(path).await.is_ok(),
        Err(_) => false,
    }
}

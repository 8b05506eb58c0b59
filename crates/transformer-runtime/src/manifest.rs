//! Manifest files on disk.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use tracing::debug;
use transformer_core::{InputManifest, INPUT_MANIFEST_FILENAME, OUTPUT_MANIFEST_FILENAME};

use crate::error::{ManifestReadError, RuntimeError};

/// Write `manifest` as 4-space indented JSON to `inputManifest.json` in `dir`.
pub async fn write_input_manifest(
    dir: &Path,
    manifest: &InputManifest,
) -> Result<PathBuf, RuntimeError> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    manifest
        .serialize(&mut ser)
        .map_err(RuntimeError::InputManifest)?;

    let path = dir.join(INPUT_MANIFEST_FILENAME);
    tokio::fs::write(&path, &buf)
        .await
        .map_err(|source| RuntimeError::Workspace {
            path: path.clone(),
            source,
        })?;

    debug!(path = %path.display(), bytes = buf.len(), "Wrote input manifest");
    Ok(path)
}

/// Read and parse `output-manifest.json` from `dir` without validating it.
pub async fn read_output_manifest(dir: &Path) -> Result<Value, ManifestReadError> {
    let path = dir.join(OUTPUT_MANIFEST_FILENAME);
    let contents = tokio::fs::read(&path).await?;
    Ok(serde_json::from_slice(&contents)?)
}

//! Per-run working and output directories.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use transformer_core::{Contract, InputManifest, OUTPUT_MANIFEST_FILENAME};

use crate::error::RuntimeError;
use crate::manifest::write_input_manifest;

/// Artifact path of the primary input, relative to `/input/`.
pub const ARTIFACT_DIR: &str = "artifact";

/// Parent of secondary input paths, relative to `/input/`.
pub const SECONDARY_DIR: &str = "secondary";

/// The host directories a run reads from and writes to.
#[derive(Debug, Clone)]
pub struct Workspace {
    working_dir: PathBuf,
    output_dir: PathBuf,
}

impl Workspace {
    /// Paths are made absolute against the current directory so they can be
    /// used as bind-mount sources.
    pub fn new(working_dir: impl AsRef<Path>, output_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: absolute(working_dir.as_ref()),
            output_dir: absolute(output_dir.as_ref()),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Host path of the output manifest the transformer writes.
    pub fn output_manifest_path(&self) -> PathBuf {
        self.output_dir.join(OUTPUT_MANIFEST_FILENAME)
    }

    /// Create both directories and write the input manifest.
    ///
    /// Returns the host path of the written manifest.
    pub async fn prepare(&self, manifest: &InputManifest) -> Result<PathBuf, RuntimeError> {
        ensure_directory(&self.working_dir).await?;
        ensure_directory(&self.output_dir).await?;
        self.remove_stale_output().await?;

        let path = write_input_manifest(&self.working_dir, manifest).await?;
        info!(
            working_dir = %self.working_dir.display(),
            output_dir = %self.output_dir.display(),
            "Prepared workspace"
        );
        Ok(path)
    }

    async fn remove_stale_output(&self) -> Result<(), RuntimeError> {
        let path = self.output_manifest_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                warn!(path = %path.display(), "Removed output manifest left by an earlier run");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RuntimeError::Workspace { path, source }),
        }
    }
}

/// Manifest `artifactPath` of a secondary input: `secondary/<identity>`.
pub fn secondary_artifact_path<D>(contract: &Contract<D>) -> String {
    format!("{}/{}", SECONDARY_DIR, path_segment(contract.identity()))
}

/// Encode an identity as a single path segment.
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-escaped, so distinct
/// identities always map to distinct segments.
fn path_segment(identity: &str) -> String {
    match identity {
        "" => return "%".to_string(),
        "." => return "%2E".to_string(),
        ".." => return "%2E%2E".to_string(),
        _ => {}
    }

    let mut segment = String::with_capacity(identity.len());
    for byte in identity.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            segment.push(char::from(byte));
        } else {
            segment.push_str(&format!("%{:02X}", byte));
        }
    }
    segment
}

/// Create `dir` if missing. Only "not found" counts as missing.
async fn ensure_directory(dir: &Path) -> Result<(), RuntimeError> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(RuntimeError::NotADirectory(dir.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| RuntimeError::Workspace {
                path: dir.to_path_buf(),
                source,
            }),
        Err(source) => Err(RuntimeError::Workspace {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// Make `path` absolute against the current directory.
pub(crate) fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use transformer_core::{PrimaryInput, INPUT_MANIFEST_FILENAME};

    fn manifest() -> InputManifest {
        InputManifest {
            input: PrimaryInput {
                contract: serde_json::from_value(json!({
                    "slug": "source-a", "version": "1.0.0", "type": "source@1.0.0", "data": {}
                }))
                .unwrap(),
                transformer_contract: serde_json::from_value(json!({
                    "slug": "build", "version": "2.0.0", "type": "transformer@1.0.0", "data": {}
                }))
                .unwrap(),
                artifact_path: ARTIFACT_DIR.to_string(),
                decrypted_secrets: None,
                decrypted_transformer_secrets: None,
            },
            secondary_input: vec![],
        }
    }

    #[tokio::test]
    async fn test_prepare_creates_directories() {
        let root = TempDir::new().unwrap();
        let workspace = Workspace::new(root.path().join("in/task-1"), root.path().join("out/task-1"));

        let path = workspace.prepare(&manifest()).await.unwrap();

        assert!(workspace.output_dir().is_dir());
        assert_eq!(path, workspace.working_dir().join(INPUT_MANIFEST_FILENAME));
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn test_prepare_rejects_file_in_place_of_directory() {
        let root = TempDir::new().unwrap();
        let output = root.path().join("out");
        std::fs::write(&output, "not a dir").unwrap();

        let workspace = Workspace::new(root.path().join("in"), &output);
        let err = workspace.prepare(&manifest()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotADirectory(p) if p == output));
    }

    #[tokio::test]
    async fn test_prepare_removes_stale_output_manifest() {
        let root = TempDir::new().unwrap();
        let workspace = Workspace::new(root.path().join("in"), root.path().join("out"));
        std::fs::create_dir_all(workspace.output_dir()).unwrap();
        std::fs::write(workspace.output_manifest_path(), "{\"results\": []}").unwrap();

        workspace.prepare(&manifest()).await.unwrap();
        assert!(!workspace.output_manifest_path().exists());
    }

    #[test]
    fn test_relative_paths_are_absolutized() {
        let workspace = Workspace::new("work", "/abs/out");
        assert!(workspace.working_dir().is_absolute());
        assert_eq!(workspace.output_dir(), Path::new("/abs/out"));
    }

    #[test]
    fn test_secondary_artifact_paths() {
        let contract: Contract = serde_json::from_value(json!({
            "id": "a/../b", "slug": "s", "version": "1.0.0", "type": "t@1.0.0", "data": {}
        }))
        .unwrap();
        assert_eq!(secondary_artifact_path(&contract), "secondary/a%2F..%2Fb");

        assert_eq!(path_segment(".."), "%2E%2E");
        assert_eq!(path_segment("abc-1.2"), "abc-1.2");
        assert_eq!(path_segment("caf\u{e9}"), "caf%C3%A9");
    }

    #[test]
    fn test_similar_identities_get_distinct_segments() {
        let identities = ["a/b", "a_b", "a%2Fb", "a b", "..", "%2E%2E", ".", ""];
        let segments: std::collections::HashSet<String> =
            identities.iter().map(|id| path_segment(id)).collect();

        assert_eq!(segments.len(), identities.len());
        assert!(segments.iter().all(|s| !s.contains('/') && s != "." && s != ".."));
    }
}

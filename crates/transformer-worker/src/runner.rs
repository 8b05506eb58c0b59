//! Task execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};
use transformer_core::{
    finalize_output_contract, ArtifactContract, OutputManifest, RunId, TaskContract,
    TransformerResult,
};
use transformer_runtime::{
    CleanupSummary, ContainerEngine, DockerCli, TransformRequest, TransformerRuntime,
};

use crate::config::Config;
use crate::error::WorkerError;
use crate::json_output;

/// Label carrying the task identity on run resources.
const TASK_LABEL: &str = "io.transformer-runtime.task";

/// Per-invocation overrides of the derived task settings.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub image: Option<String>,
    pub artifact_directory: Option<PathBuf>,
}

/// Runs tasks with one runtime.
pub struct Runner {
    config: Config,
    runtime: TransformerRuntime,
}

impl Runner {
    /// Runner driving the docker CLI.
    pub fn new(config: Config) -> Result<Self, WorkerError> {
        let engine = Arc::new(DockerCli::new(config.docker_path.clone()));
        Self::with_engine(config, engine)
    }

    pub fn with_engine(
        config: Config,
        engine: Arc<dyn ContainerEngine>,
    ) -> Result<Self, WorkerError> {
        let decryptor = config.decryptor()?;
        if !decryptor.has_key() {
            warn!("No secret key configured, secrets will be passed through undecrypted");
        }
        Ok(Self {
            runtime: TransformerRuntime::new(engine, decryptor),
            config,
        })
    }

    /// Load a task contract from a JSON file.
    pub async fn load_task(path: &Path) -> Result<TaskContract, WorkerError> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|source| WorkerError::TaskFile {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_slice(&contents).map_err(|source| WorkerError::TaskParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Run `task` and finalize its output contracts.
    ///
    /// A failed transformer still yields `Ok`: the manifest then holds an
    /// error result.
    pub async fn run(
        &self,
        task: &TaskContract,
        overrides: RunOverrides,
    ) -> Result<OutputManifest, WorkerError> {
        let dirs = self.config.task_directories(task);
        let image = overrides
            .image
            .unwrap_or_else(|| self.config.transformer_image(task));
        let transformer = task.data.transformer.versioned_slug();

        info!(task = %task.identity(), transformer = %transformer, image = %image, "Running task");
        json_output::emit_task_started(task.identity(), &transformer, &image);

        let request = TransformRequest::new(
            task.data.input.clone(),
            task.data.transformer.clone(),
            image,
            overrides.artifact_directory.unwrap_or(dirs.artifact),
            dirs.input,
            dirs.output,
        )
        .with_privileged(self.config.privileged)
        .with_label(TASK_LABEL, task.identity());

        let manifest = self.runtime.run_transformer(&request).await?;
        let manifest = finalize_results(&task.data.input, manifest)?;

        let manifest_json = serde_json::to_value(&manifest).unwrap_or_default();
        if manifest.is_error() {
            let message = first_error_message(&manifest).unwrap_or_default();
            error!(task = %task.identity(), error = %message, "Task failed");
            json_output::emit_task_failed(task.identity(), &message, &manifest_json);
        } else {
            info!(task = %task.identity(), results = manifest.results.len(), "Task completed");
            json_output::emit_task_completed(task.identity(), &manifest_json);
        }

        Ok(manifest)
    }

    /// Remove resources left behind by an interrupted run.
    pub async fn cleanup(&self, run_id: &RunId) -> Result<CleanupSummary, WorkerError> {
        let summary = self.runtime.cleanup(run_id).await?;
        json_output::emit_cleanup_completed(
            run_id.as_str(),
            summary.containers_removed,
            summary.volumes_removed,
        );
        Ok(summary)
    }
}

/// Finalize every non-error result contract against `input`.
fn finalize_results(
    input: &ArtifactContract,
    mut manifest: OutputManifest,
) -> Result<OutputManifest, WorkerError> {
    for result in &mut manifest.results {
        match result {
            TransformerResult::ContractOnly { contract }
            | TransformerResult::Artifact { contract, .. }
            | TransformerResult::Image { contract, .. }
            | TransformerResult::ManifestList { contract, .. } => {
                *contract = finalize_output_contract(input, contract.clone())?;
            }
            TransformerResult::Error { .. } => {}
        }
    }
    Ok(manifest)
}

fn first_error_message(manifest: &OutputManifest) -> Option<String> {
    manifest.results.iter().find_map(|result| match result {
        TransformerResult::Error { contract } => Some(contract.data.message.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::io::Cursor;
    use tempfile::TempDir;
    use transformer_core::OUTPUT_MANIFEST_FILENAME;
    use transformer_runtime::{
        AttachedContainer, ContainerSpec, EngineError, LabelFilter, Labels,
    };

    /// Engine whose container writes `manifest` and exits with `code`.
    struct ScriptedEngine {
        manifest: Option<Value>,
        code: i64,
    }

    #[async_trait]
    impl ContainerEngine for ScriptedEngine {
        async fn create_volume(&self, _name: &str, _labels: &Labels) -> Result<(), EngineError> {
            Ok(())
        }

        async fn run_container(&self, spec: &ContainerSpec) -> Result<AttachedContainer, EngineError> {
            assert_eq!(spec.labels[TASK_LABEL], "abc");
            if let Some(manifest) = &self.manifest {
                let output = spec
                    .mounts
                    .iter()
                    .find(|m| m.target == "/output/")
                    .unwrap();
                std::fs::write(
                    Path::new(&output.source).join(OUTPUT_MANIFEST_FILENAME),
                    serde_json::to_vec(manifest).unwrap(),
                )
                .unwrap();
            }
            let code = self.code;
            Ok(AttachedContainer {
                stdout: Box::new(Cursor::new(Vec::<u8>::new())),
                stderr: Box::new(Cursor::new(b"boom\n".to_vec())),
                exit: Box::pin(async move { Ok::<i64, EngineError>(code) }),
            })
        }

        async fn list_containers(&self, _filter: &LabelFilter) -> Result<Vec<String>, EngineError> {
            Ok(Vec::new())
        }

        async fn remove_container(&self, _id: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn list_volumes(&self, _filter: &LabelFilter) -> Result<Vec<String>, EngineError> {
            Ok(Vec::new())
        }

        async fn remove_volume(&self, _name: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn task() -> TaskContract {
        serde_json::from_value(json!({
            "id": "abc",
            "slug": "task-abc",
            "version": "1.0.0",
            "type": "task@1.0.0",
            "data": {
                "actor": "user-1",
                "input": {
                    "slug": "source-foo",
                    "version": "3.0.0",
                    "type": "source@1.0.0",
                    "data": { "$transformer": { "artifactReady": true, "baseSlug": "foo" } }
                },
                "transformer": { "slug": "build", "version": "2.1.0", "type": "transformer@1.0.0", "data": {} }
            }
        }))
        .unwrap()
    }

    fn runner(root: &TempDir, engine: ScriptedEngine) -> Runner {
        let config = Config {
            input_root: root.path().join("in"),
            output_root: root.path().join("out"),
            ..Default::default()
        };
        Runner::with_engine(config, Arc::new(engine)).unwrap()
    }

    #[tokio::test]
    async fn test_run_finalizes_outputs() {
        let root = TempDir::new().unwrap();
        let engine = ScriptedEngine {
            manifest: Some(json!({
                "results": [{
                    "contract": {
                        "type": "image@1.0.0",
                        "data": { "$transformer": { "slugSuffix": "amd64" } }
                    }
                }]
            })),
            code: 0,
        };

        let manifest = runner(&root, engine)
            .run(&task(), RunOverrides::default())
            .await
            .unwrap();

        let TransformerResult::ContractOnly { contract } = &manifest.results[0] else {
            panic!("unexpected result");
        };
        assert_eq!(contract.slug, "image-foo-amd64");
        assert_eq!(contract.version, "3.0.0");
        assert_eq!(contract.data["$transformer"]["artifactReady"], false);
        assert!(root.path().join("in/task-abc/inputManifest.json").is_file());
    }

    #[tokio::test]
    async fn test_failed_run_is_left_unfinalized() {
        let root = TempDir::new().unwrap();
        let engine = ScriptedEngine {
            manifest: None,
            code: 2,
        };

        let manifest = runner(&root, engine)
            .run(&task(), RunOverrides::default())
            .await
            .unwrap();

        assert!(manifest.is_error());
        assert_eq!(first_error_message(&manifest).as_deref(), Some("exit-code 2"));
    }

    #[tokio::test]
    async fn test_load_task_errors() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("missing.json");
        assert!(matches!(
            Runner::load_task(&missing).await,
            Err(WorkerError::TaskFile { .. })
        ));

        let broken = root.path().join("broken.json");
        std::fs::write(&broken, "{}").unwrap();
        assert!(matches!(
            Runner::load_task(&broken).await,
            Err(WorkerError::TaskParse { .. })
        ));

        let good = root.path().join("task.json");
        std::fs::write(&good, serde_json::to_vec(&task()).unwrap()).unwrap();
        assert_eq!(Runner::load_task(&good).await.unwrap().slug, "task-abc");
    }
}

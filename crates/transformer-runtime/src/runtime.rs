//! Transformer runtime: one image, one input, one manifest out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};
use transformer_core::{
    ArtifactContract, Contract, InputManifest, OutputManifest, PrimaryInput, RunId,
    SecondaryInputEntry, TransformerContract, INPUT_MANIFEST_FILENAME, OUTPUT_MANIFEST_FILENAME,
};

use crate::engine::{ContainerEngine, ContainerSpec, Labels, Mount};
use crate::error::{EngineError, RuntimeError};
use crate::report::ErrorReporter;
use crate::scope::{cleanup_run, CleanupSummary, RunScope};
use crate::secrets::SecretsDecryptor;
use crate::tail::{tail_stream, CapturedLogs, StreamKind};
use crate::validate::create_output_manifest;
use crate::workspace::{absolute, secondary_artifact_path, Workspace, ARTIFACT_DIR};

const CONTAINER_INPUT_DIR: &str = "/input";
const CONTAINER_OUTPUT_DIR: &str = "/output";

/// Where the scratch volume is mounted, for transformers running docker-in-docker.
const SCRATCH_MOUNT: &str = "/var/lib/docker";

/// An extra input bound next to the primary artifact.
#[derive(Debug, Clone)]
pub struct SecondaryInput {
    pub contract: Contract,
    pub artifact_directory: PathBuf,
}

impl SecondaryInput {
    pub fn new(contract: Contract, artifact_directory: impl Into<PathBuf>) -> Self {
        Self {
            contract,
            artifact_directory: artifact_directory.into(),
        }
    }
}

/// Everything one transformer run needs.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub input: ArtifactContract,
    pub transformer: TransformerContract,
    /// Image reference of the transformer.
    pub image: String,
    /// Host directory holding the primary input artifact.
    pub artifact_directory: PathBuf,
    pub working_directory: PathBuf,
    pub output_directory: PathBuf,
    pub secondary_inputs: Vec<SecondaryInput>,
    pub privileged: bool,
    /// Extra labels for the run's container and volume.
    pub labels: Labels,
}

impl TransformRequest {
    pub fn new(
        input: ArtifactContract,
        transformer: TransformerContract,
        image: impl Into<String>,
        artifact_directory: impl Into<PathBuf>,
        working_directory: impl Into<PathBuf>,
        output_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input,
            transformer,
            image: image.into(),
            artifact_directory: artifact_directory.into(),
            working_directory: working_directory.into(),
            output_directory: output_directory.into(),
            secondary_inputs: Vec::new(),
            privileged: false,
            labels: Labels::new(),
        }
    }

    /// Run the container privileged.
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Add a label to the run's container and volume.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Bind another contract's artifact under `/input/secondary/`.
    pub fn with_secondary_input(mut self, input: SecondaryInput) -> Self {
        self.secondary_inputs.push(input);
        self
    }
}

/// Runs transformer images through a container engine.
#[derive(Clone)]
pub struct TransformerRuntime {
    engine: Arc<dyn ContainerEngine>,
    decryptor: SecretsDecryptor,
}

impl TransformerRuntime {
    pub fn new(engine: Arc<dyn ContainerEngine>, decryptor: SecretsDecryptor) -> Self {
        Self { engine, decryptor }
    }

    /// Run the transformer of `request` to completion.
    ///
    /// Every failure from launch through validation comes back as an
    /// `Ok` manifest holding a single error result. `Err` means the run never
    /// started (workspace or secrets) or a partial output manifest could not
    /// be read while reporting. All engine resources of the run are removed
    /// before this returns.
    pub async fn run_transformer(
        &self,
        request: &TransformRequest,
    ) -> Result<OutputManifest, RuntimeError> {
        let manifest = self.input_manifest(request)?;
        let workspace = Workspace::new(&request.working_directory, &request.output_directory);
        let manifest_path = workspace.prepare(&manifest).await?;

        let scope = RunScope::acquire(Arc::clone(&self.engine));
        info!(
            run_id = %scope.run_id(),
            input = %request.input.slug,
            transformer = %request.transformer.versioned_slug(),
            image = %request.image,
            "Starting transformer run"
        );

        let mut logs = CapturedLogs::default();
        let outcome = self
            .execute(&scope, request, &workspace, &manifest_path, &mut logs)
            .await;

        let result = match outcome {
            Ok(manifest) => {
                info!(
                    run_id = %scope.run_id(),
                    results = manifest.results.len(),
                    "Transformer run succeeded"
                );
                Ok(manifest)
            }
            Err(failure) => {
                ErrorReporter::new(&request.input, &request.transformer, workspace.output_dir())
                    .report(&failure, &logs)
                    .await
            }
        };

        let run_id = scope.run_id().clone();
        if let Err(e) = scope.release().await {
            error!(run_id = %run_id, error = %e, "Cleanup after run failed");
        }

        result
    }

    /// Remove every resource left behind by `run_id`.
    pub async fn cleanup(&self, run_id: &RunId) -> Result<CleanupSummary, EngineError> {
        cleanup_run(self.engine.as_ref(), run_id).await
    }

    fn input_manifest(&self, request: &TransformRequest) -> Result<InputManifest, RuntimeError> {
        let decrypted_secrets = self.decryptor.decrypt(request.input.data.encrypted_secrets())?;
        let decrypted_transformer_secrets = self
            .decryptor
            .decrypt(request.transformer.data.encrypted_secrets.as_ref())?;

        let secondary_input = request
            .secondary_inputs
            .iter()
            .map(|secondary| SecondaryInputEntry {
                contract: secondary.contract.clone(),
                artifact_path: secondary_artifact_path(&secondary.contract),
            })
            .collect();

        Ok(InputManifest {
            input: PrimaryInput {
                contract: request.input.clone(),
                transformer_contract: request.transformer.clone(),
                artifact_path: ARTIFACT_DIR.to_string(),
                decrypted_secrets,
                decrypted_transformer_secrets,
            },
            secondary_input,
        })
    }

    /// Steps that turn into an error result on failure. Log tails collected
    /// before the failure are left in `logs`.
    async fn execute(
        &self,
        scope: &RunScope,
        request: &TransformRequest,
        workspace: &Workspace,
        manifest_path: &Path,
        logs: &mut CapturedLogs,
    ) -> Result<OutputManifest, RuntimeError> {
        let labels = scope.labels(&request.labels);
        let volume = format!("tmp-docker-{}", scope.run_id());
        self.engine.create_volume(&volume, &labels).await?;

        let spec = container_spec(scope.run_id(), request, workspace, manifest_path, &volume, labels);
        let container = self.engine.run_container(&spec).await?;

        let (stdout, stderr, exit) = tokio::join!(
            tail_stream(container.stdout, StreamKind::Stdout, scope.run_id()),
            tail_stream(container.stderr, StreamKind::Stderr, scope.run_id()),
            container.exit,
        );
        logs.stdout = stdout;
        logs.stderr = stderr;

        let exit_code = exit?;
        info!(run_id = %scope.run_id(), exit_code, "Transformer container exited");

        create_output_manifest(exit_code, workspace.output_dir()).await
    }
}

fn container_spec(
    run_id: &RunId,
    request: &TransformRequest,
    workspace: &Workspace,
    manifest_path: &Path,
    volume: &str,
    labels: Labels,
) -> ContainerSpec {
    let mut mounts = vec![
        Mount::bind(
            manifest_path,
            format!("{}/{}", CONTAINER_INPUT_DIR, INPUT_MANIFEST_FILENAME),
            true,
        ),
        Mount::bind(
            &absolute(&request.artifact_directory),
            format!("{}/{}/", CONTAINER_INPUT_DIR, ARTIFACT_DIR),
            true,
        ),
    ];
    for secondary in &request.secondary_inputs {
        mounts.push(Mount::bind(
            &absolute(&secondary.artifact_directory),
            format!(
                "{}/{}/",
                CONTAINER_INPUT_DIR,
                secondary_artifact_path(&secondary.contract)
            ),
            true,
        ));
    }
    mounts.push(Mount::bind(
        workspace.output_dir(),
        format!("{}/", CONTAINER_OUTPUT_DIR),
        false,
    ));
    mounts.push(Mount::volume(volume, SCRATCH_MOUNT));

    ContainerSpec {
        name: format!("transformer-{}", run_id),
        image: request.image.clone(),
        command: Vec::new(),
        env: vec![
            (
                "INPUT".to_string(),
                format!("{}/{}", CONTAINER_INPUT_DIR, INPUT_MANIFEST_FILENAME),
            ),
            (
                "OUTPUT".to_string(),
                format!("{}/{}", CONTAINER_OUTPUT_DIR, OUTPUT_MANIFEST_FILENAME),
            ),
        ],
        mounts,
        labels,
        privileged: request.privileged,
        init: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AttachedContainer, LabelFilter, RUN_LABEL, TRANSFORMER_LABEL};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::io::Cursor;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use transformer_core::{TransformerResult, ERROR_CONTRACT_TYPE};

    #[derive(Clone)]
    enum Behavior {
        /// Write `manifest` to the output mount and exit 0.
        Succeed(Value),
        /// Print to both streams, optionally leave a manifest, then exit.
        Exit { code: i64, partial: Option<Value> },
        /// Fail before the container starts.
        FailLaunch,
    }

    struct FakeEngine {
        behavior: Behavior,
        specs: Mutex<Vec<ContainerSpec>>,
        containers: Mutex<Vec<(String, Labels)>>,
        volumes: Mutex<Vec<(String, Labels)>>,
        fail_cleanup: bool,
    }

    impl FakeEngine {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self::build(behavior, false))
        }

        /// Engine whose container removal and volume listing always fail.
        fn with_failing_cleanup(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self::build(behavior, true))
        }

        fn build(behavior: Behavior, fail_cleanup: bool) -> Self {
            Self {
                behavior,
                specs: Mutex::new(Vec::new()),
                containers: Mutex::new(Vec::new()),
                volumes: Mutex::new(Vec::new()),
                fail_cleanup,
            }
        }

        fn is_clean(&self) -> bool {
            self.containers.lock().unwrap().is_empty() && self.volumes.lock().unwrap().is_empty()
        }

        fn last_spec(&self) -> ContainerSpec {
            self.specs.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn output_mount(spec: &ContainerSpec) -> PathBuf {
        spec.mounts
            .iter()
            .find(|m| m.target == "/output/")
            .map(|m| PathBuf::from(&m.source))
            .unwrap()
    }

    fn attached(stdout: &str, stderr: &str, code: i64) -> AttachedContainer {
        AttachedContainer {
            stdout: Box::new(Cursor::new(stdout.as_bytes().to_vec())),
            stderr: Box::new(Cursor::new(stderr.as_bytes().to_vec())),
            exit: Box::pin(async move { Ok::<i64, EngineError>(code) }),
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn create_volume(&self, name: &str, labels: &Labels) -> Result<(), EngineError> {
            self.volumes
                .lock()
                .unwrap()
                .push((name.to_string(), labels.clone()));
            Ok(())
        }

        async fn run_container(&self, spec: &ContainerSpec) -> Result<AttachedContainer, EngineError> {
            self.specs.lock().unwrap().push(spec.clone());
            if matches!(self.behavior, Behavior::FailLaunch) {
                return Err(EngineError::Launch("image not found".to_string()));
            }
            self.containers
                .lock()
                .unwrap()
                .push((spec.name.clone(), spec.labels.clone()));

            let output = output_mount(spec).join(OUTPUT_MANIFEST_FILENAME);
            match &self.behavior {
                Behavior::Succeed(manifest) => {
                    std::fs::write(&output, serde_json::to_vec(manifest).unwrap()).unwrap();
                    Ok(attached("transforming\n", "", 0))
                }
                Behavior::Exit { code, partial } => {
                    if let Some(partial) = partial {
                        std::fs::write(&output, serde_json::to_vec(partial).unwrap()).unwrap();
                    }
                    Ok(attached("step 1\nstep 2\n", "fatal: broken\n", *code))
                }
                Behavior::FailLaunch => unreachable!(),
            }
        }

        async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<String>, EngineError> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, labels)| filter.matches(labels))
                .map(|(id, _)| id.clone())
                .collect())
        }

        async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
            if self.fail_cleanup {
                return Err(EngineError::Command("container is busy".to_string()));
            }
            self.containers.lock().unwrap().retain(|(c, _)| c != id);
            Ok(())
        }

        async fn list_volumes(&self, filter: &LabelFilter) -> Result<Vec<String>, EngineError> {
            if self.fail_cleanup {
                return Err(EngineError::Command("daemon unavailable".to_string()));
            }
            Ok(self
                .volumes
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, labels)| filter.matches(labels))
                .map(|(name, _)| name.clone())
                .collect())
        }

        async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
            self.volumes.lock().unwrap().retain(|(v, _)| v != name);
            Ok(())
        }
    }

    fn request(root: &TempDir) -> TransformRequest {
        let input = serde_json::from_value(json!({
            "id": "input-1",
            "slug": "source-a",
            "version": "1.0.0",
            "type": "source@1.0.0",
            "data": { "$transformer": { "encryptedSecrets": { "token": "c2VjcmV0" } } }
        }))
        .unwrap();
        let transformer = serde_json::from_value(json!({
            "slug": "build",
            "version": "2.0.0",
            "type": "transformer@1.0.0",
            "data": { "expectedOutputTypes": ["image@1.0.0"] }
        }))
        .unwrap();

        TransformRequest::new(
            input,
            transformer,
            "registry.local/build:2.0.0",
            root.path().join("artifact"),
            root.path().join("work"),
            root.path().join("out"),
        )
    }

    fn valid_manifest() -> Value {
        json!({
            "results": [{
                "contract": {
                    "slug": "image-a",
                    "version": "1.0.0",
                    "type": "image@1.0.0",
                    "data": { "$transformer": { "slugSuffix": "amd64" } }
                }
            }]
        })
    }

    fn runtime(engine: &Arc<FakeEngine>) -> TransformerRuntime {
        TransformerRuntime::new(engine.clone(), SecretsDecryptor::passthrough())
    }

    #[tokio::test]
    async fn test_successful_run() {
        let root = TempDir::new().unwrap();
        let engine = FakeEngine::new(Behavior::Succeed(valid_manifest()));

        let manifest = runtime(&engine).run_transformer(&request(&root)).await.unwrap();

        assert_eq!(manifest.exit_code, Some(0));
        assert_eq!(manifest.results.len(), 1);
        assert!(matches!(manifest.results[0], TransformerResult::ContractOnly { .. }));
        assert_eq!(
            serde_json::to_value(&manifest.results).unwrap(),
            valid_manifest()["results"]
        );
        assert!(engine.is_clean());
    }

    #[tokio::test]
    async fn test_container_wiring() {
        let root = TempDir::new().unwrap();
        let engine = FakeEngine::new(Behavior::Succeed(valid_manifest()));
        let request = request(&root).with_privileged(true).with_label("team", "build");

        runtime(&engine).run_transformer(&request).await.unwrap();

        let spec = engine.last_spec();
        assert!(spec.init);
        assert!(spec.privileged);
        assert_eq!(spec.labels["team"], "build");
        assert_eq!(spec.labels[TRANSFORMER_LABEL], "true");
        let run_id = spec.labels[RUN_LABEL].clone();
        assert_eq!(spec.name, format!("transformer-{}", run_id));
        assert!(spec
            .env
            .contains(&("INPUT".to_string(), "/input/inputManifest.json".to_string())));
        assert!(spec
            .env
            .contains(&("OUTPUT".to_string(), "/output/output-manifest.json".to_string())));

        let targets: Vec<_> = spec.mounts.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(
            targets,
            vec![
                "/input/inputManifest.json",
                "/input/artifact/",
                "/output/",
                "/var/lib/docker"
            ]
        );
        assert!(spec.mounts[0].read_only && spec.mounts[1].read_only);
        assert!(!spec.mounts[2].read_only);
        assert_eq!(spec.mounts[3].source, format!("tmp-docker-{}", run_id));
    }

    #[tokio::test]
    async fn test_input_manifest_written() {
        let root = TempDir::new().unwrap();
        let engine = FakeEngine::new(Behavior::Succeed(valid_manifest()));

        runtime(&engine).run_transformer(&request(&root)).await.unwrap();

        let text = std::fs::read_to_string(root.path().join("work").join(INPUT_MANIFEST_FILENAME)).unwrap();
        let written: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(written["input"]["artifactPath"], "artifact");
        assert_eq!(written["input"]["contract"]["slug"], "source-a");
        // No key configured: secrets pass through untouched
        assert_eq!(written["input"]["decryptedSecrets"], json!({ "token": "c2VjcmV0" }));
        assert!(written["input"].get("decryptedTransformerSecrets").is_none());
    }

    #[tokio::test]
    async fn test_exit_code_becomes_error_result() {
        let root = TempDir::new().unwrap();
        let engine = FakeEngine::new(Behavior::Exit {
            code: 1,
            partial: None,
        });

        let manifest = runtime(&engine).run_transformer(&request(&root)).await.unwrap();

        assert!(manifest.is_error());
        assert_eq!(manifest.results.len(), 1);
        let TransformerResult::Error { contract } = &manifest.results[0] else {
            panic!("not an error result");
        };
        assert_eq!(contract.contract_type, ERROR_CONTRACT_TYPE);
        assert_eq!(contract.data.code, "1");
        assert_eq!(contract.data.std_out_tail, "step 1\nstep 2");
        assert_eq!(contract.data.std_err_tail, "fatal: broken");
        assert!(engine.is_clean());
    }

    #[tokio::test]
    async fn test_cleanup_failure_keeps_success_result() {
        let root = TempDir::new().unwrap();
        let engine = FakeEngine::with_failing_cleanup(Behavior::Succeed(valid_manifest()));

        let manifest = runtime(&engine).run_transformer(&request(&root)).await.unwrap();

        assert!(!manifest.is_error());
        assert_eq!(manifest.exit_code, Some(0));
        assert_eq!(manifest.results.len(), 1);
        assert!(!engine.is_clean());
    }

    #[tokio::test]
    async fn test_cleanup_failure_keeps_error_result() {
        let root = TempDir::new().unwrap();
        let engine = FakeEngine::with_failing_cleanup(Behavior::Exit {
            code: 1,
            partial: None,
        });

        let manifest = runtime(&engine).run_transformer(&request(&root)).await.unwrap();

        let TransformerResult::Error { contract } = &manifest.results[0] else {
            panic!("not an error result");
        };
        assert_eq!(contract.data.code, "1");
        assert_eq!(contract.data.message, "exit-code 1");
    }

    #[tokio::test]
    async fn test_partial_manifest_attached_on_failure() {
        let root = TempDir::new().unwrap();
        let engine = FakeEngine::new(Behavior::Exit {
            code: 4,
            partial: Some(json!({ "results": [] })),
        });

        let manifest = runtime(&engine).run_transformer(&request(&root)).await.unwrap();

        let value = serde_json::to_value(&manifest).unwrap();
        let data = &value["results"][0]["contract"]["data"];
        assert_eq!(data["code"], "4");
        assert_eq!(data["outputManifest"], json!({ "results": [] }));
    }

    #[tokio::test]
    async fn test_launch_failure_has_no_output_manifest() {
        let root = TempDir::new().unwrap();
        let engine = FakeEngine::new(Behavior::FailLaunch);

        let manifest = runtime(&engine).run_transformer(&request(&root)).await.unwrap();

        let value = serde_json::to_value(&manifest).unwrap();
        let data = &value["results"][0]["contract"]["data"];
        assert_eq!(value["results"][0]["contract"]["type"], ERROR_CONTRACT_TYPE);
        assert!(data.get("outputManifest").is_none());
        assert_eq!(data["code"], "1");
        assert!(data["message"].as_str().unwrap().contains("image not found"));
        // The scratch volume is gone too
        assert!(engine.is_clean());
    }

    #[tokio::test]
    async fn test_stale_manifest_is_not_reported() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("out")).unwrap();
        std::fs::write(
            root.path().join("out").join(OUTPUT_MANIFEST_FILENAME),
            serde_json::to_vec(&valid_manifest()).unwrap(),
        )
        .unwrap();
        let engine = FakeEngine::new(Behavior::Exit {
            code: 0,
            partial: None,
        });

        let manifest = runtime(&engine).run_transformer(&request(&root)).await.unwrap();

        assert!(manifest.is_error());
        let TransformerResult::Error { contract } = &manifest.results[0] else {
            panic!("not an error result");
        };
        assert!(contract.data.message.starts_with("Could not load output manifest"));
    }

    #[tokio::test]
    async fn test_secondary_inputs_are_bound_apart() {
        let root = TempDir::new().unwrap();
        let engine = FakeEngine::new(Behavior::Succeed(valid_manifest()));
        let secondary = |id: &str| {
            SecondaryInput::new(
                serde_json::from_value(json!({
                    "id": id, "slug": id, "version": "1.0.0", "type": "source@1.0.0", "data": {}
                }))
                .unwrap(),
                root.path().join(id),
            )
        };
        let request = request(&root)
            .with_secondary_input(secondary("A"))
            .with_secondary_input(secondary("B"));

        runtime(&engine).run_transformer(&request).await.unwrap();

        let spec = engine.last_spec();
        let a = spec
            .mounts
            .iter()
            .find(|m| m.target == "/input/secondary/A/")
            .unwrap();
        let b = spec
            .mounts
            .iter()
            .find(|m| m.target == "/input/secondary/B/")
            .unwrap();
        assert!(a.read_only && b.read_only);
        assert_ne!(a.source, b.source);

        let text = std::fs::read_to_string(root.path().join("work").join(INPUT_MANIFEST_FILENAME)).unwrap();
        let written: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(written["secondaryInput"][0]["artifactPath"], "secondary/A");
        assert_eq!(written["secondaryInput"][1]["artifactPath"], "secondary/B");
    }

    #[tokio::test]
    async fn test_workspace_failure_starts_nothing() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("out"), "a file").unwrap();
        let engine = FakeEngine::new(Behavior::Succeed(valid_manifest()));

        let err = runtime(&engine)
            .run_transformer(&request(&root))
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::NotADirectory(_)));
        assert!(engine.specs.lock().unwrap().is_empty());
        assert!(engine.volumes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_cleanup_by_run_id() {
        let engine = FakeEngine::new(Behavior::FailLaunch);
        let mut labels = Labels::new();
        labels.insert(RUN_LABEL.to_string(), "orphan".to_string());
        engine.create_volume("tmp-docker-orphan", &labels).await.unwrap();

        let summary = runtime(&engine).cleanup(&RunId::new("orphan")).await.unwrap();
        assert_eq!(summary.volumes_removed, 1);
        assert!(engine.is_clean());
    }
}

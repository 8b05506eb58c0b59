//! Container engine backed by the Docker CLI.
//!
//! Every operation shells out to `docker`; `run_container` keeps the
//! `docker run` client attached so the container's stdout and stderr arrive
//! on the client's pipes.

use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::engine::{AttachedContainer, ContainerEngine, ContainerSpec, LabelFilter, Labels};
use crate::error::EngineError;

/// Exit code `docker run` uses when the daemon fails before the container starts.
///
/// The code is ambiguous: a transformer that itself exits with 125 is also
/// reported as a launch failure, and its error result carries code `"1"`.
const DOCKER_RUN_FAILURE: i32 = 125;

/// Docker CLI engine.
#[derive(Debug, Clone)]
pub struct DockerCli {
    /// Path to the docker executable.
    docker_path: String,
}

impl DockerCli {
    /// Create an engine using the given docker executable.
    ///
    /// The path can be just "docker" to use PATH lookup, or a full path.
    pub fn new(docker_path: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.docker_path);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a docker command to completion and return its stdout.
    async fn exec(&self, args: &[String]) -> Result<String, EngineError> {
        debug!(args = ?args, "Running docker command");

        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Command(format!(
                "docker {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn_error(&self, e: std::io::Error) -> EngineError {
        if e.kind() == ErrorKind::NotFound {
            EngineError::NotFound(self.docker_path.clone())
        } else {
            EngineError::Io(e)
        }
    }

    fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--attach".to_string(),
            "stdout".to_string(),
            "--attach".to_string(),
            "stderr".to_string(),
        ];

        if spec.init {
            args.push("--init".to_string());
        }
        if spec.privileged {
            args.push("--privileged".to_string());
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for mount in &spec.mounts {
            args.push("--volume".to_string());
            args.push(mount.to_bind_spec());
        }
        push_labels(&mut args, &spec.labels);

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Treat "no such ..." failures of a force-remove as success.
    fn ignore_missing(result: Result<String, EngineError>) -> Result<(), EngineError> {
        match result {
            Ok(_) => Ok(()),
            Err(EngineError::Command(message)) if message.contains("No such") => {
                debug!(message = %message, "Resource already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

fn push_labels(args: &mut Vec<String>, labels: &Labels) {
    for (key, value) in labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
}

fn non_empty_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn create_volume(&self, name: &str, labels: &Labels) -> Result<(), EngineError> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        push_labels(&mut args, labels);
        args.push(name.to_string());

        self.exec(&args).await?;
        info!(volume = %name, "Created scratch volume");
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<AttachedContainer, EngineError> {
        let args = Self::run_args(spec);
        info!(image = %spec.image, name = %spec.name, "Spawning transformer container");
        debug!(args = ?args, "Full docker run command");

        let mut child = self
            .command()
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(error = %e, "Failed to spawn docker run");
                self.spawn_error(e)
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Launch("failed to get stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Launch("failed to get stderr".to_string()))?;

        let exit = Box::pin(async move {
            let status = child.wait().await?;
            container_exit_code(status.code())
        });

        Ok(AttachedContainer {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit,
        })
    }

    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<String>, EngineError> {
        let args = [
            "ps".to_string(),
            "--all".to_string(),
            "--quiet".to_string(),
            "--filter".to_string(),
            format!("label={}", filter),
        ];
        Ok(non_empty_lines(&self.exec(&args).await?))
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let args = ["rm".to_string(), "--force".to_string(), id.to_string()];
        Self::ignore_missing(self.exec(&args).await)
    }

    async fn list_volumes(&self, filter: &LabelFilter) -> Result<Vec<String>, EngineError> {
        let args = [
            "volume".to_string(),
            "ls".to_string(),
            "--quiet".to_string(),
            "--filter".to_string(),
            format!("label={}", filter),
        ];
        Ok(non_empty_lines(&self.exec(&args).await?))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let args = [
            "volume".to_string(),
            "rm".to_string(),
            "--force".to_string(),
            name.to_string(),
        ];
        Self::ignore_missing(self.exec(&args).await)
    }
}

/// Map the exit status of `docker run --attach` to the container's exit code.
fn container_exit_code(code: Option<i32>) -> Result<i64, EngineError> {
    match code {
        Some(DOCKER_RUN_FAILURE) => Err(EngineError::Launch(format!(
            "docker run exited with {} before the container started",
            DOCKER_RUN_FAILURE
        ))),
        Some(code) => Ok(i64::from(code)),
        None => Err(EngineError::Launch(
            "docker run was terminated by a signal".to_string(),
        )),
    }
}

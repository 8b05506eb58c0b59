//! Per-run resource scope.
//!
//! Every container and volume a run creates carries the run's label. A
//! [`RunScope`] owns the run identity and removes everything carrying that
//! label when it is released, or in the background if it is dropped first.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use transformer_core::RunId;

use crate::engine::{ContainerEngine, LabelFilter, Labels, RUN_LABEL, TRANSFORMER_LABEL};
use crate::error::EngineError;

/// Resources removed by a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub containers_removed: usize,
    pub volumes_removed: usize,
}

/// Scope of a single run's engine resources.
pub struct RunScope {
    run_id: RunId,
    engine: Arc<dyn ContainerEngine>,
    released: bool,
}

impl RunScope {
    /// Open a scope with a fresh run identity.
    pub fn acquire(engine: Arc<dyn ContainerEngine>) -> Self {
        let run_id = RunId::generate();
        debug!(run_id = %run_id, "Acquired run scope");
        Self {
            run_id,
            engine,
            released: false,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Labels for a resource created in this scope.
    ///
    /// The run and transformer labels override same-named entries of `extra`.
    pub fn labels(&self, extra: &Labels) -> Labels {
        let mut labels = extra.clone();
        labels.insert(RUN_LABEL.to_string(), self.run_id.to_string());
        labels.insert(TRANSFORMER_LABEL.to_string(), "true".to_string());
        labels
    }

    /// Remove every resource labeled with this run.
    ///
    /// If this future is dropped before cleanup finishes, the drop guard
    /// takes over.
    pub async fn release(mut self) -> Result<CleanupSummary, EngineError> {
        let result = cleanup_run(self.engine.as_ref(), &self.run_id).await;
        self.released = true;
        result
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let run_id = self.run_id.clone();
        let engine = Arc::clone(&self.engine);
        match Handle::try_current() {
            Ok(handle) => {
                warn!(run_id = %run_id, "Run scope dropped before release, cleaning up in background");
                handle.spawn(async move {
                    if let Err(e) = cleanup_run(engine.as_ref(), &run_id).await {
                        error!(run_id = %run_id, error = %e, "Background cleanup failed");
                    }
                });
            }
            Err(_) => {
                error!(run_id = %run_id, "Run scope dropped outside a runtime, resources left behind");
            }
        }
    }
}

/// Force-remove all containers, then all volumes, labeled with `run_id`.
///
/// Keeps going past individual failures and returns the first one.
pub async fn cleanup_run(
    engine: &dyn ContainerEngine,
    run_id: &RunId,
) -> Result<CleanupSummary, EngineError> {
    let filter = LabelFilter::new(RUN_LABEL, run_id.as_str());
    let mut summary = CleanupSummary::default();
    let mut first_error: Option<EngineError> = None;

    match engine.list_containers(&filter).await {
        Ok(containers) => {
            for id in containers {
                match engine.remove_container(&id).await {
                    Ok(()) => summary.containers_removed += 1,
                    Err(e) => {
                        error!(run_id = %run_id, container = %id, error = %e, "Failed to remove container");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Failed to list containers");
            first_error.get_or_insert(e);
        }
    }

    // Volumes can only go once no container uses them
    match engine.list_volumes(&filter).await {
        Ok(volumes) => {
            for name in volumes {
                match engine.remove_volume(&name).await {
                    Ok(()) => summary.volumes_removed += 1,
                    Err(e) => {
                        error!(run_id = %run_id, volume = %name, error = %e, "Failed to remove volume");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Failed to list volumes");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            info!(
                run_id = %run_id,
                containers = summary.containers_removed,
                volumes = summary.volumes_removed,
                "Cleaned up run resources"
            );
            Ok(summary)
        }
    }
}

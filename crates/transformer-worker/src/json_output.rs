//! JSON output for streaming events to stdout.

use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

/// Global flag to enable JSON output mode.
static JSON_MODE_ENABLED: AtomicBool = AtomicBool::new(false);

/// Enable JSON output mode.
pub fn enable_json_mode() {
    JSON_MODE_ENABLED.store(true, Ordering::SeqCst);
}

/// Check if JSON mode is enabled.
pub fn is_json_mode() -> bool {
    JSON_MODE_ENABLED.load(Ordering::SeqCst)
}

/// JSON event types that can be emitted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonEventType {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    CleanupCompleted,
    Error,
}

/// A JSON event to be output to stdout.
#[derive(Debug, Clone, Serialize)]
pub struct JsonEvent {
    pub event: JsonEventType,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl JsonEvent {
    /// Create a new JSON event with the current timestamp.
    pub fn new(event: JsonEventType, data: serde_json::Value) -> Self {
        Self {
            event,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }

    /// Output this event as a JSON line to stdout.
    pub fn emit(&self) {
        if !is_json_mode() {
            return;
        }
        if let Ok(json) = serde_json::to_string(self) {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{}", json);
            let _ = stdout.flush();
        }
    }
}

/// Emit a task_started event.
pub fn emit_task_started(task_id: &str, transformer: &str, image: &str) {
    JsonEvent::new(
        JsonEventType::TaskStarted,
        serde_json::json!({
            "task_id": task_id,
            "transformer": transformer,
            "image": image,
        }),
    )
    .emit();
}

/// Emit a task_completed event carrying the output manifest.
pub fn emit_task_completed(task_id: &str, manifest: &serde_json::Value) {
    JsonEvent::new(
        JsonEventType::TaskCompleted,
        serde_json::json!({
            "task_id": task_id,
            "manifest": manifest,
        }),
    )
    .emit();
}

/// Emit a task_failed event. The manifest holds the error result.
pub fn emit_task_failed(task_id: &str, message: &str, manifest: &serde_json::Value) {
    JsonEvent::new(
        JsonEventType::TaskFailed,
        serde_json::json!({
            "task_id": task_id,
            "message": message,
            "manifest": manifest,
        }),
    )
    .emit();
}

/// Emit a cleanup_completed event.
pub fn emit_cleanup_completed(run_id: &str, containers: usize, volumes: usize) {
    JsonEvent::new(
        JsonEventType::CleanupCompleted,
        serde_json::json!({
            "run_id": run_id,
            "containers_removed": containers,
            "volumes_removed": volumes,
        }),
    )
    .emit();
}

/// Emit an error event.
pub fn emit_error(message: &str) {
    JsonEvent::new(
        JsonEventType::Error,
        serde_json::json!({
            "message": message,
        }),
    )
    .emit();
}

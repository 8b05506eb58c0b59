//! Task contracts and output contract finalization.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::contract::{ArtifactContract, Contract, TransformerContract};
use crate::error::CoreError;

/// Payload of a task: run `transformer` over `input` on behalf of `actor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    /// Actor the task runs as.
    #[serde(default)]
    pub actor: String,

    /// The artifact to transform.
    pub input: ArtifactContract,

    /// The transformer to run.
    pub transformer: TransformerContract,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A unit of work handed to the worker by the scheduler.
pub type TaskContract = Contract<TaskData>;

impl TaskContract {
    /// Directory name used for this task's input and output trees.
    pub fn directory_name(&self) -> String {
        format!("task-{}", self.identity())
    }
}

/// Prepare a transformer-proposed output contract for storage.
///
/// The output inherits the input's version and `$transformer` state (the
/// output's own `$transformer` keys win) and is marked not ready. When the
/// input carries a `baseSlug`, the slug becomes deterministic:
/// `<outputType>-<baseSlug>[-<slugSuffix>]`.
pub fn finalize_output_contract(
    input: &ArtifactContract,
    mut output: Contract,
) -> Result<Contract, CoreError> {
    output.version = input.version.clone();

    let mut meta = match &input.data.transformer {
        Some(meta) => match serde_json::to_value(meta)? {
            Value::Object(map) => map,
            _ => Map::new(),
        },
        None => Map::new(),
    };

    if !output.data.is_object() {
        return Err(CoreError::InvalidResult(format!(
            "contract {} has non-object data",
            output.slug
        )));
    }
    if let Some(Value::Object(own)) = output.data.get("$transformer") {
        for (key, value) in own {
            meta.insert(key.clone(), value.clone());
        }
    }
    meta.insert("artifactReady".to_string(), Value::Bool(false));

    let base_slug = input
        .data
        .transformer
        .as_ref()
        .and_then(|m| m.base_slug.clone());
    if let Some(base_slug) = base_slug {
        let mut slug = format!("{}-{}", output.type_name(), base_slug);
        if let Some(suffix) = meta.get("slugSuffix").and_then(Value::as_str) {
            if !suffix.is_empty() {
                slug.push('-');
                slug.push_str(suffix);
            }
        }
        output.slug = slug;
    }

    if let Some(data) = output.data.as_object_mut() {
        data.insert("$transformer".to_string(), Value::Object(meta));
    }
    Ok(output)
}

//! Contract types.
//!
//! A contract is a versioned, typed record owned by the contract store. The
//! runtime reads input and transformer contracts and proposes new contract
//! bodies for outputs. Fields this crate does not model are kept in `extra`
//! so that a contract survives a read/write cycle unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::ids::ContractId;

/// A versioned record with a free-form `data` payload.
///
/// `D` defaults to an untyped JSON payload. Typed views such as
/// [`ArtifactContract`] and [`TransformerContract`] fix `D` to a struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract<D = Value> {
    /// Store-assigned identifier. Absent on proposed output contracts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ContractId>,

    /// Human-readable unique name. Proposed output contracts may leave it
    /// empty for finalization to derive.
    #[serde(default)]
    pub slug: String,

    /// Semantic version of the contract. Overwritten on finalized outputs.
    #[serde(default)]
    pub version: String,

    /// Contract type, e.g. `source@1.0.0`.
    #[serde(rename = "type")]
    pub contract_type: String,

    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Contract payload.
    pub data: D,

    /// Remaining top-level fields (tags, markers, links, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<D> Contract<D> {
    /// Identity used to key per-contract resources: the id when assigned,
    /// otherwise the slug.
    pub fn identity(&self) -> &str {
        self.id.as_ref().map(|id| id.as_str()).unwrap_or(&self.slug)
    }

    /// Type name without the version suffix (`source@1.0.0` -> `source`).
    pub fn type_name(&self) -> &str {
        self.contract_type
            .split('@')
            .next()
            .unwrap_or(&self.contract_type)
    }

    /// `slug@version` reference to this contract.
    pub fn versioned_slug(&self) -> String {
        format!("{}@{}", self.slug, self.version)
    }
}

impl<D: Serialize> Contract<D> {
    /// Convert a typed contract into its untyped JSON form.
    pub fn to_untyped(&self) -> Result<Contract, CoreError> {
        Ok(Contract {
            id: self.id.clone(),
            slug: self.slug.clone(),
            version: self.version.clone(),
            contract_type: self.contract_type.clone(),
            name: self.name.clone(),
            data: serde_json::to_value(&self.data)?,
            extra: self.extra.clone(),
        })
    }
}

impl Contract {
    /// Reinterpret an untyped contract with a typed payload.
    pub fn into_typed<D: serde::de::DeserializeOwned>(self) -> Result<Contract<D>, CoreError> {
        Ok(Contract {
            id: self.id,
            slug: self.slug,
            version: self.version,
            contract_type: self.contract_type,
            name: self.name,
            data: serde_json::from_value(self.data)?,
            extra: self.extra,
        })
    }
}

/// Readiness marker of an artifact: either a flag or the time it became ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtifactReady {
    Flag(bool),
    Timestamp(String),
}

impl Default for ArtifactReady {
    fn default() -> Self {
        Self::Flag(false)
    }
}

/// Transformation lifecycle state stored under `data.$transformer`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerMeta {
    #[serde(default)]
    pub artifact_ready: ArtifactReady,

    /// Stable naming anchor for derived contracts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_slug: Option<String>,

    /// Disambiguator when one transformer emits several outputs of one type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug_suffix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_secrets: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of an artifact contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactData {
    #[serde(
        rename = "$transformer",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub transformer: Option<TransformerMeta>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ArtifactData {
    /// Encrypted secrets attached to the artifact, if any.
    pub fn encrypted_secrets(&self) -> Option<&Value> {
        self.transformer
            .as_ref()
            .and_then(|meta| meta.encrypted_secrets.as_ref())
    }
}

/// How much of the input a transformer consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputType {
    /// Only the contract; no artifact is pulled.
    ContractOnly,
    /// Contract and artifact.
    #[default]
    Full,
}

/// Platform requirements of a transformer image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

/// A formula to be evaluated by the external formula engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    #[serde(rename = "$$formula")]
    pub formula: String,
}

/// Either a formula or a literal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormulaOrValue {
    Formula(Formula),
    Value(Value),
}

impl Default for FormulaOrValue {
    fn default() -> Self {
        Self::Value(Value::Null)
    }
}

impl FormulaOrValue {
    pub fn formula(expr: impl Into<String>) -> Self {
        Self::Formula(Formula {
            formula: expr.into(),
        })
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }
}

/// One backflow rule: write `downstream_value` at `upstream_path` of the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackflowMapping {
    pub upstream_path: FormulaOrValue,
    #[serde(default)]
    pub downstream_value: FormulaOrValue,
}

/// Payload of a transformer contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerData {
    #[serde(default)]
    pub input_filter: Value,

    #[serde(default)]
    pub input_type: InputType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Requirements>,

    #[serde(default)]
    pub backflow_mapping: Vec<BackflowMapping>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_secrets: Option<Value>,

    /// Output types the transformer is expected to emit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_output_types: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An artifact tracked through transformation.
pub type ArtifactContract = Contract<ArtifactData>;

/// A transformer definition.
pub type TransformerContract = Contract<TransformerData>;

//! Manifest documents exchanged with a transformer container.
//!
//! The runtime writes an [`InputManifest`] before launch and reads an
//! [`OutputManifest`] after the container exits. Filenames and the shapes
//! below are the fixed contract a transformer image must honor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::contract::{ArtifactContract, Contract, TransformerContract};
use crate::error::CoreError;

/// Filename of the input manifest inside the working directory.
pub const INPUT_MANIFEST_FILENAME: &str = "inputManifest.json";

/// Filename of the output manifest inside the output directory.
pub const OUTPUT_MANIFEST_FILENAME: &str = "output-manifest.json";

/// Contract type of synthetic error results.
pub const ERROR_CONTRACT_TYPE: &str = "error@1.0.0";

/// Document handed to the transformer container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputManifest {
    pub input: PrimaryInput,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_input: Vec<SecondaryInputEntry>,
}

/// The primary input of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryInput {
    pub contract: ArtifactContract,

    pub transformer_contract: TransformerContract,

    /// Artifact location relative to the container's input directory.
    pub artifact_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decrypted_secrets: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decrypted_transformer_secrets: Option<Value>,
}

/// An additional input bound next to the primary artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryInputEntry {
    pub contract: Contract,
    pub artifact_path: String,
}

/// Payload of a synthetic error result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub message: String,

    #[serde(default)]
    pub code: String,

    /// `slug@version` of the transformer that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer: Option<String>,

    #[serde(default)]
    pub expected_output_types: Vec<String>,

    #[serde(default)]
    pub std_out_tail: String,

    #[serde(default)]
    pub std_err_tail: String,

    /// Partial output manifest found on disk despite the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_manifest: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Contract describing a failed run.
pub type ErrorContract = Contract<ErrorData>;

/// One result of a transformer run.
///
/// On the wire a result is `{contract, artifactPath?, imagePath?, manifestList?}`;
/// in memory each delivery mode is its own variant, and contracts of type
/// [`ERROR_CONTRACT_TYPE`] become [`TransformerResult::Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResult", into = "RawResult")]
pub enum TransformerResult {
    /// A contract with no artifact attached.
    ContractOnly { contract: Contract },

    /// A directory or file under the output directory.
    Artifact {
        contract: Contract,
        artifact_path: String,
    },

    /// A saved container image under the output directory.
    Image { contract: Contract, image_path: String },

    /// A list of image references to assemble into a manifest list.
    ManifestList {
        contract: Contract,
        manifest_list: Vec<String>,
    },

    /// A failed run.
    Error { contract: ErrorContract },
}

impl TransformerResult {
    /// Returns true for error results.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Slug of the result contract.
    pub fn slug(&self) -> &str {
        match self {
            Self::ContractOnly { contract }
            | Self::Artifact { contract, .. }
            | Self::Image { contract, .. }
            | Self::ManifestList { contract, .. } => &contract.slug,
            Self::Error { contract } => &contract.slug,
        }
    }

    /// The artifact path, for `Artifact` results.
    pub fn artifact_path(&self) -> Option<&str> {
        match self {
            Self::Artifact { artifact_path, .. } => Some(artifact_path),
            _ => None,
        }
    }

    /// The result contract in untyped form.
    pub fn to_contract(&self) -> Result<Contract, CoreError> {
        match self {
            Self::ContractOnly { contract }
            | Self::Artifact { contract, .. }
            | Self::Image { contract, .. }
            | Self::ManifestList { contract, .. } => Ok(contract.clone()),
            Self::Error { contract } => contract.to_untyped(),
        }
    }
}

/// Wire shape of a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResult {
    contract: Contract,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    manifest_list: Option<Vec<String>>,
}

impl TryFrom<RawResult> for TransformerResult {
    type Error = CoreError;

    fn try_from(raw: RawResult) -> Result<Self, CoreError> {
        let RawResult {
            contract,
            artifact_path,
            image_path,
            manifest_list,
        } = raw;

        // An empty artifactPath means "no artifact"
        let artifact_path = artifact_path.filter(|p| !p.is_empty());
        let modes = [
            artifact_path.is_some(),
            image_path.is_some(),
            manifest_list.is_some(),
        ];
        if modes.iter().filter(|set| **set).count() > 1 {
            return Err(CoreError::MultipleDeliveryModes {
                slug: contract.slug,
            });
        }

        if contract.contract_type == ERROR_CONTRACT_TYPE {
            return Ok(Self::Error {
                contract: contract.into_typed()?,
            });
        }

        Ok(match (artifact_path, image_path, manifest_list) {
            (Some(artifact_path), _, _) => Self::Artifact {
                contract,
                artifact_path,
            },
            (_, Some(image_path), _) => Self::Image {
                contract,
                image_path,
            },
            (_, _, Some(manifest_list)) => Self::ManifestList {
                contract,
                manifest_list,
            },
            _ => Self::ContractOnly { contract },
        })
    }
}

impl From<TransformerResult> for RawResult {
    fn from(result: TransformerResult) -> Self {
        let raw = |contract| RawResult {
            contract,
            artifact_path: None,
            image_path: None,
            manifest_list: None,
        };
        match result {
            TransformerResult::ContractOnly { contract } => raw(contract),
            TransformerResult::Artifact {
                contract,
                artifact_path,
            } => RawResult {
                artifact_path: Some(artifact_path),
                ..raw(contract)
            },
            TransformerResult::Image {
                contract,
                image_path,
            } => RawResult {
                image_path: Some(image_path),
                ..raw(contract)
            },
            TransformerResult::ManifestList {
                contract,
                manifest_list,
            } => RawResult {
                manifest_list: Some(manifest_list),
                ..raw(contract)
            },
            TransformerResult::Error { contract } => {
                let data = serde_json::to_value(&contract.data).unwrap_or(Value::Null);
                raw(Contract {
                    id: contract.id,
                    slug: contract.slug,
                    version: contract.version,
                    contract_type: contract.contract_type,
                    name: contract.name,
                    data,
                    extra: contract.extra,
                })
            }
        }
    }
}

/// Document produced by the transformer container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputManifest {
    /// Container exit code; set once the manifest has been validated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,

    pub results: Vec<TransformerResult>,
}

impl OutputManifest {
    /// Wrap a single error contract as a manifest.
    pub fn from_error(contract: ErrorContract) -> Self {
        Self {
            exit_code: None,
            results: vec![TransformerResult::Error { contract }],
        }
    }

    /// Returns true if any result is an error result.
    pub fn is_error(&self) -> bool {
        self.results.iter().any(TransformerResult::is_error)
    }
}

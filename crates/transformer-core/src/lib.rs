//! Transformer Runtime Core Types
//!
//! This crate contains the pure domain types shared by the runtime and the
//! worker, with no dependencies on:
//! - Filesystem or network access
//! - The container engine
//! - Async runtime specifics
//!
//! Contracts are the versioned records exchanged with the contract store;
//! manifests are the documents exchanged with a transformer container.

pub mod contract;
pub mod error;
pub mod ids;
pub mod manifest;
pub mod reference;
pub mod task;

// Re-export commonly used types
pub use contract::{
    ArtifactContract, ArtifactData, ArtifactReady, BackflowMapping, Contract, Formula,
    FormulaOrValue, InputType, Requirements, TransformerContract, TransformerData, TransformerMeta,
};
pub use error::CoreError;
pub use ids::{ContractId, RunId};
pub use manifest::{
    ErrorContract, ErrorData, InputManifest, OutputManifest, PrimaryInput, SecondaryInputEntry,
    TransformerResult, ERROR_CONTRACT_TYPE, INPUT_MANIFEST_FILENAME, OUTPUT_MANIFEST_FILENAME,
};
pub use reference::ArtifactReference;
pub use task::{finalize_output_contract, TaskContract, TaskData};

//! Registry addresses of contract artifacts.

use std::fmt;

use crate::contract::Contract;

/// Registry address of a contract's artifact: `<host>[:<port>]/<slug>:<version>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReference {
    registry: String,
    slug: String,
    version: String,
}

impl ArtifactReference {
    /// Reference for `contract` on the registry at `host` (and optional `port`).
    pub fn for_contract<D>(host: &str, port: Option<u16>, contract: &Contract<D>) -> Self {
        let registry = match port {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        Self {
            registry,
            slug: contract.slug.clone(),
            version: contract.version.clone(),
        }
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.slug, self.version)
    }
}

//! Decryption of encrypted secret trees.
//!
//! Secrets arrive as a JSON tree whose string leaves are base64-encoded RSA
//! (PKCS#1 v1.5) ciphertexts. Decrypted leaves are base64-encoded again so
//! binary secrets survive the trip through the input manifest.

use base64::{engine::general_purpose::STANDARD, Engine};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::SecretsError;

/// Decrypts secret trees with an optional RSA private key.
///
/// Without a key, trees are passed through unchanged.
#[derive(Debug, Clone, Default)]
pub struct SecretsDecryptor {
    key: Option<RsaPrivateKey>,
}

impl SecretsDecryptor {
    /// Create a decryptor from an already-parsed key.
    pub fn new(key: Option<RsaPrivateKey>) -> Self {
        Self { key }
    }

    /// A decryptor without a key.
    pub fn passthrough() -> Self {
        Self { key: None }
    }

    /// Create a decryptor from a PKCS#1 or PKCS#8 PEM document.
    pub fn from_pem(pem: Option<&str>) -> Result<Self, SecretsError> {
        let Some(pem) = pem.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(Self::passthrough());
        };

        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| SecretsError::InvalidKey(e.to_string()))?;
        Ok(Self::new(Some(key)))
    }

    /// Create a decryptor from a base64-encoded PEM document, the form the
    /// key takes in configuration.
    pub fn from_base64_pem(encoded: Option<&str>) -> Result<Self, SecretsError> {
        let Some(encoded) = encoded.map(str::trim).filter(|e| !e.is_empty()) else {
            return Ok(Self::passthrough());
        };

        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| SecretsError::InvalidKey(e.to_string()))?;
        let pem = String::from_utf8(bytes).map_err(|e| SecretsError::InvalidKey(e.to_string()))?;
        Self::from_pem(Some(&pem))
    }

    /// Returns true if a key is configured.
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Decrypt every string leaf of `secrets`.
    ///
    /// Returns `None` for absent or null input. Leaves that are neither
    /// strings, objects nor arrays are logged and dropped.
    pub fn decrypt(&self, secrets: Option<&Value>) -> Result<Option<Value>, SecretsError> {
        let secrets = match secrets {
            None | Some(Value::Null) => return Ok(None),
            Some(secrets) => secrets,
        };

        let Some(key) = &self.key else {
            warn!("no secrets key provided! Will pass along secrets without decryption. Should not happen in production");
            return Ok(Some(secrets.clone()));
        };

        decrypt_tree(key, secrets, "").map(Some)
    }
}

fn decrypt_tree(key: &RsaPrivateKey, value: &Value, path: &str) -> Result<Value, SecretsError> {
    match value {
        Value::String(leaf) => Ok(Value::String(decrypt_leaf(key, leaf)?)),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (name, child) in map {
                let child_path = join_path(path, name);
                if let Some(decrypted) = decrypt_child(key, child, &child_path)? {
                    out.insert(name.clone(), decrypted);
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, child) in items.iter().enumerate() {
                let child_path = join_path(path, &index.to_string());
                if let Some(decrypted) = decrypt_child(key, child, &child_path)? {
                    out.push(decrypted);
                }
            }
            Ok(Value::Array(out))
        }
        other => {
            warn!(key = %path, kind = %kind(other), "unknown type in secrets");
            Ok(Value::Null)
        }
    }
}

fn decrypt_child(
    key: &RsaPrivateKey,
    child: &Value,
    path: &str,
) -> Result<Option<Value>, SecretsError> {
    match child {
        Value::String(_) | Value::Object(_) | Value::Array(_) => {
            decrypt_tree(key, child, path).map(Some)
        }
        other => {
            warn!(key = %path, kind = %kind(other), "unknown type in secrets");
            Ok(None)
        }
    }
}

/// Decrypt one base64 ciphertext, which may span several key-sized blocks.
fn decrypt_leaf(key: &RsaPrivateKey, encoded: &str) -> Result<String, SecretsError> {
    let ciphertext = STANDARD
        .decode(encoded)
        .map_err(|e| SecretsError::Decrypt(e.to_string()))?;

    let block = key.size();
    if ciphertext.is_empty() || ciphertext.len() % block != 0 {
        return Err(SecretsError::Decrypt(format!(
            "ciphertext length {} is not a multiple of the key size {}",
            ciphertext.len(),
            block
        )));
    }

    let mut plaintext = Vec::with_capacity(ciphertext.len());
    let mut rng = rand::thread_rng();
    for chunk in ciphertext.chunks(block) {
        let part = key
            .decrypt_blinded(&mut rng, Pkcs1v15Encrypt, chunk)
            .map_err(|e| SecretsError::Decrypt(e.to_string()))?;
        plaintext.extend_from_slice(&part);
    }

    Ok(STANDARD.encode(plaintext))
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

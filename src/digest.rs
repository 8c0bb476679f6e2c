//! Payload digests echoed by the server.
//!
//! The digest is a lowercase hex string whose length is fixed by the
//! algorithm; it doubles as the frame size of server responses.

use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Algorithm used when none is configured.
pub const DEFAULT_ALGORITHM: &str = "sha1";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("unsupported digest algorithm '{0}'")]
    UnsupportedAlgorithm(String),
}

/// Named digest function.
///
/// The algorithm is resolved on every call, so a misconfigured digester
/// fails per payload rather than at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digester {
    algorithm: String,
}

impl Digester {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Length of the hex digest in bytes.
    pub fn output_len(&self) -> Result<usize, DigestError> {
        match self.algorithm.to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(40),
            "sha256" | "sha-256" => Ok(64),
            _ => Err(self.unsupported()),
        }
    }

    /// Hex digest of `data`.
    pub fn digest(&self, data: &[u8]) -> Result<String, DigestError> {
        match self.algorithm.to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(format!("{:x}", Sha1::digest(data))),
            "sha256" | "sha-256" => Ok(format!("{:x}", Sha256::digest(data))),
            _ => Err(self.unsupported()),
        }
    }

    fn unsupported(&self) -> DigestError {
        DigestError::UnsupportedAlgorithm(self.algorithm.clone())
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new(DEFAULT_ALGORITHM)
    }
}

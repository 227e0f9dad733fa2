//! State snapshots: a stack's full resource graph at one instant.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};

/// An exported stack state, as the backend produced it.
///
/// The deployment document is opaque here: it is carried as the exact bytes
/// the backend returned and handed back unchanged on import. Only
/// [`crate::checkpoint::validate_deployment`] looks inside, and only to check
/// that it parses as an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Schema version of the deployment document.
    pub version: u32,

    /// Raw deployment JSON.
    pub deployment: String,
}

/// Envelope used by `stack export` and `stack import`.
#[derive(Serialize, Deserialize)]
struct ExportDocument<'a> {
    version: u32,
    #[serde(borrow)]
    deployment: &'a RawValue,
}

impl StateSnapshot {
    pub fn new(version: u32, deployment: impl Into<String>) -> Self {
        Self {
            version,
            deployment: deployment.into(),
        }
    }

    /// Parse the envelope written by `stack export`, keeping the deployment bytes verbatim.
    pub fn from_export_json(json: &str) -> Result<Self, serde_json::Error> {
        let doc: ExportDocument<'_> = serde_json::from_str(json)?;
        Ok(Self {
            version: doc.version,
            deployment: doc.deployment.get().to_string(),
        })
    }

    /// Render the envelope expected by `stack import`.
    ///
    /// Fails if the deployment bytes are not valid JSON.
    pub fn to_export_json(&self) -> Result<String, serde_json::Error> {
        let deployment: &RawValue = serde_json::from_str(&self.deployment)?;
        serde_json::to_string(&ExportDocument {
            version: self.version,
            deployment,
        })
    }

    /// Hex SHA-256 of the deployment bytes.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.deployment.as_bytes()))
    }

    /// First twelve hex digits of [`Self::digest`], for display.
    pub fn short_digest(&self) -> String {
        let mut digest = self.digest();
        digest.truncate(12);
        digest
    }
}

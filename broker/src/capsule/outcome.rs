use super::CapsuleError;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{fs, path::Path};

/// name of the outcome artifact the remote run path leaves next to the capsule
pub const OUTCOME_FILE: &str = "outcome.yaml";

/// What happened when a capsule was run on the remote side.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// the task returned normally
    Returned { value: Value },
    /// the task returned an error or panicked
    Raised { kind: String, message: String },
    /// the capsule never reached the task: undecodable or unknown target
    Rejected { reason: String },
}

impl Outcome {
    pub fn is_returned(&self) -> bool {
        matches!(self, Self::Returned { .. })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CapsuleError> {
        serde_yaml::to_string(self)
            .map(String::into_bytes)
            .map_err(CapsuleError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CapsuleError> {
        serde_yaml::from_slice(bytes).map_err(CapsuleError::Decode)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), CapsuleError> {
        Ok(fs::write(path, self.encode()?)?)
    }

    pub fn read_from(path: &Path) -> Result<Self, CapsuleError> {
        Self::decode(&fs::read(path)?)
    }
}

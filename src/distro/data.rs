//! Distro Sync Units
//!
//! What moves between peers: a [`SyncKey`] naming the transferred resources,
//! the encoded content and the operation it represents.

use serde::{Deserialize, Serialize};

use crate::store::ResourceKey;

/// Reserved key for whole-store transfer
pub const SNAPSHOT_KEY: &str = "snapshot";

/// Reserved key for verification rounds
pub const CHECKSUM_KEY: &str = "checksum";

/// Identifies what is being transferred
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKey {
    /// One resource
    Single(ResourceKey),
    /// A batch of resources exchanged with `target`
    Combined {
        keys: Vec<ResourceKey>,
        target: String,
    },
    /// The whole store
    Snapshot,
    /// Checksum digest of owned keys
    Checksum,
}

impl SyncKey {
    /// Resource keys named by this key; empty for the reserved keys
    pub fn resource_keys(&self) -> Vec<ResourceKey> {
        match self {
            SyncKey::Single(key) => vec![key.clone()],
            SyncKey::Combined { keys, .. } => keys.clone(),
            SyncKey::Snapshot | SyncKey::Checksum => Vec::new(),
        }
    }

    /// Wire name of the key
    pub fn name(&self) -> String {
        match self {
            SyncKey::Single(key) => key.clone(),
            SyncKey::Combined { keys, target } => format!("{}@{}", keys.join(","), target),
            SyncKey::Snapshot => SNAPSHOT_KEY.to_string(),
            SyncKey::Checksum => CHECKSUM_KEY.to_string(),
        }
    }
}

impl std::fmt::Display for SyncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Operation carried by a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataOperation {
    /// Full datum states (`ResourceKey -> Datum`)
    Sync,
    /// Checksum digest (`ResourceKey -> checksum`)
    Verify,
    /// Whole store (`ResourceKey -> Datum`)
    Snapshot,
    /// Instance additions (`ResourceKey -> InstanceOperation`)
    Add,
    /// Instance removals (`ResourceKey -> InstanceOperation`)
    Remove,
}

impl std::fmt::Display for DataOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataOperation::Sync => write!(f, "SYNC"),
            DataOperation::Verify => write!(f, "VERIFY"),
            DataOperation::Snapshot => write!(f, "SNAPSHOT"),
            DataOperation::Add => write!(f, "ADD"),
            DataOperation::Remove => write!(f, "REMOVE"),
        }
    }
}

/// The unit moved by a transport agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub key: SyncKey,
    pub content: Vec<u8>,
    pub operation: DataOperation,
}

impl SyncPayload {
    pub fn new(key: SyncKey, content: Vec<u8>, operation: DataOperation) -> Self {
        Self {
            key,
            content,
            operation,
        }
    }
}

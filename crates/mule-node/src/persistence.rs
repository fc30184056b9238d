use std::fs;
use std::path::Path;

use mule_core::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::QueueSnapshot;
use crate::runtime::RuntimeStats;
use crate::trust::TrustSnapshot;

/// Errors returned by node snapshot persistence helpers.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to encode node snapshot: {0}")]
    Encode(String),
    #[error("failed to decode node snapshot: {0}")]
    Decode(String),
    #[error("failed to read snapshot file: {0}")]
    Read(std::io::Error),
    #[error("failed to write snapshot file: {0}")]
    Write(std::io::Error),
    #[error("snapshot belongs to node {0}")]
    ForeignSnapshot(NodeId),
}

/// Everything a node needs to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub queues: QueueSnapshot,
    pub trust: TrustSnapshot,
    pub stats: RuntimeStats,
}

pub fn encode_snapshot_cbor(snapshot: &NodeSnapshot) -> Result<Vec<u8>, PersistenceError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(snapshot, &mut out)
        .map_err(|e| PersistenceError::Encode(e.to_string()))?;
    Ok(out)
}

pub fn decode_snapshot_cbor(bytes: &[u8]) -> Result<NodeSnapshot, PersistenceError> {
    ciborium::de::from_reader(bytes).map_err(|e| PersistenceError::Decode(e.to_string()))
}

/// Writes the snapshot next to `path` and renames it into place.
pub fn save_snapshot_to_path(
    path: impl AsRef<Path>,
    snapshot: &NodeSnapshot,
) -> Result<(), PersistenceError> {
    let bytes = encode_snapshot_cbor(snapshot)?;
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(PersistenceError::Write)?;
    fs::rename(&tmp, path).map_err(PersistenceError::Write)
}

pub fn load_snapshot_from_path(path: impl AsRef<Path>) -> Result<NodeSnapshot, PersistenceError> {
    let bytes = fs::read(path.as_ref()).map_err(PersistenceError::Read)?;
    decode_snapshot_cbor(&bytes)
}

/// Loads the snapshot if the file exists.
pub fn load_snapshot_if_present(
    path: impl AsRef<Path>,
) -> Result<Option<NodeSnapshot>, PersistenceError> {
    if !path.as_ref().exists() {
        return Ok(None);
    }
    load_snapshot_from_path(path).map(Some)
}

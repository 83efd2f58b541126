//! Core data model (spec §3): `Peer`, `NodeChunk`, `StoredNode`,
//! `RemoteNode`, `NodeEvent`. Grounded in `lansync/common.py`,
//! `lansync/peer.py` and `lansync/models.py` of the original Python
//! implementation, flattened from their ORM object graph into plain rows
//! (spec §9 "cyclic references").

use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// MD5 hex digest, used as a non-cryptographic content/path identifier
/// (spec §9 Open Question: integrity relies on the sender's declared hash
/// matching the bytes received, not on MD5 collision resistance).
pub type Hash = String;

pub fn md5_hex(data: &[u8]) -> Hash {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn hash_path(relative_path: &str) -> Hash {
    md5_hex(relative_path.as_bytes())
}

/// A device reachable on the LAN under a shared namespace. Identity is
/// `device_id`; `address`/`port`/`last_seen` are mutated by discovery and
/// otherwise read-only from the core's perspective.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub address: String,
    pub port: u16,
    pub device_id: String,
    #[serde(skip, default = "now_secs")]
    pub last_seen: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Peer {
    pub fn new(address: impl Into<String>, port: u16, device_id: impl Into<String>) -> Self {
        Peer {
            address: address.into(),
            port,
            device_id: device_id.into(),
            last_seen: now_secs(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.address, self.port)
    }

    /// Mirrors `Peer.update` in `peer.py`: refresh last-seen, and note a
    /// relocation if the address/port moved.
    pub fn touch(&mut self, address: &str, port: u16) {
        if (self.address.as_str(), self.port) != (address, port) {
            self.address = address.to_string();
            self.port = port;
        }
        self.last_seen = now_secs();
    }
}

/// A contiguous byte range of a file, content-addressed by `hash`. Two
/// `NodeChunk`s with equal `(hash, size)` are content-equivalent regardless
/// of `offset` — the same bytes may live at multiple offsets within or
/// across files (reuse).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeChunk {
    pub hash: Hash,
    pub size: u32,
    pub offset: u64,
}

impl NodeChunk {
    /// Verifies `data` is exactly this chunk's declared bytes: length and
    /// hash must both match (spec §3 `NodeChunk`, `lansync/common.py`'s
    /// `NodeChunk.check`).
    pub fn check(&self, data: &[u8]) -> crate::error::Result<()> {
        if data.len() as u32 != self.size {
            return Err(crate::error::Error::Integrity(format!(
                "chunk {} expected {} bytes, got {}",
                self.hash,
                self.size,
                data.len()
            )));
        }
        let actual = md5_hex(data);
        if actual != self.hash {
            return Err(crate::error::Error::Integrity(format!(
                "chunk hash mismatch: expected {}, got {}",
                self.hash, actual
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeOperation {
    Create,
    Delete,
}

impl std::fmt::Display for NodeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeOperation::Create => write!(f, "create"),
            NodeOperation::Delete => write!(f, "delete"),
        }
    }
}

/// Wire representation of an entry in the coordinator's event log (spec
/// §6 "NodeEvent JSON schema").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeEvent {
    pub key: String,
    pub operation: NodeOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
    pub path: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<NodeChunk>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Peer-authoritative metadata received from the event log. Immutable per
/// sequence number.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteNode {
    pub namespace: String,
    pub key: String,
    pub sequence_number: i64,
    pub path: String,
    pub timestamp: String,
    pub checksum: Option<String>,
    pub size: u64,
    pub chunks: Vec<NodeChunk>,
    pub signature: Option<String>,
}

impl RemoteNode {
    /// `remote_updated` half of the sync decision table (spec §4.G).
    pub fn updated(&self, stored: &StoredNode) -> bool {
        self.checksum != stored.checksum
    }
}

/// Local state for a file under sync: the last known synced view, plus a
/// `ready` flag marking a file still being assembled from a placeholder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredNode {
    pub id: i64,
    pub namespace: String,
    pub key: String,
    pub path: String,
    pub checksum: Option<String>,
    pub size: u64,
    pub signature: Option<String>,
    pub local_mtime: i64,
    pub local_ctime: i64,
    pub ready: bool,
}

/// A file as observed directly on disk, not yet reconciled against the
/// local store. `checksum` is lazily filled in by the caller (mirrors the
/// Python `LocalNode.checksum` property's memoized `_checksum`) since
/// hashing the whole file is only needed on the decision-table paths that
/// actually compare content.
#[derive(Clone, Debug)]
pub struct LocalNode {
    pub root_folder: std::path::PathBuf,
    pub path: String,
    pub key: Hash,
    pub mtime: i64,
    pub ctime: i64,
    pub size: u64,
    pub checksum: Option<Hash>,
}

impl LocalNode {
    pub fn new(root_folder: std::path::PathBuf, path: String, mtime: i64, ctime: i64, size: u64) -> Self {
        let key = hash_path(&path);
        LocalNode {
            root_folder,
            path,
            key,
            mtime,
            ctime,
            size,
            checksum: None,
        }
    }

    pub fn local_path(&self) -> std::path::PathBuf {
        self.root_folder.join(&self.path)
    }

    /// `local_updated` half of the sync decision table (spec §4.G).
    pub fn updated(&self, stored: &StoredNode) -> bool {
        (self.mtime, self.ctime) != (stored.local_mtime, stored.local_ctime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_path_is_stable_md5() {
        assert_eq!(hash_path("a/b.txt"), hash_path("a/b.txt"));
        assert_ne!(hash_path("a/b.txt"), hash_path("a/c.txt"));
        assert_eq!(hash_path("a/b.txt").len(), 32);
    }

    #[test]
    fn node_chunk_check_detects_mismatch() {
        let data = b"hello world";
        let chunk = NodeChunk {
            hash: md5_hex(data),
            size: data.len() as u32,
            offset: 0,
        };
        assert!(chunk.check(data).is_ok());
        assert!(chunk.check(b"hello worlD").is_err());
        assert!(chunk.check(b"short").is_err());
    }
}

use crate::dht::NodeId;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Invalid peer address {host}:{port}")]
    InvalidAddress { host: String, port: u16 },
}

/// Anything that can live inside a k-bucket: keyed by a NodeId and
/// carrying a last-seen timestamp (unix seconds).
pub trait Keyed: Clone {
    fn key(&self) -> &NodeId;

    fn last_seen(&self) -> u64;

    /// Records a fresh contact. Values without a liveness notion ignore it.
    fn touch(&mut self, _now: u64) {}

    fn is_older_than(&self, seconds: u64, now: u64) -> bool {
        let last_seen = self.last_seen();
        now.saturating_sub(last_seen) > seconds && last_seen > 0
    }
}

/// Wire form of a peer: `[host, port, last_seen]`.
pub type PeerTuple = (String, u16, u64);

/// Per-remote-node state kept in the routing table.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "PeerTuple", try_from = "PeerTuple")]
pub struct PeerRecord {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: u64,
    pub joined: u64,
    /// Session key of the most recent exchange with this peer.
    pub session_key: Option<[u8; 32]>,
}

impl PeerRecord {
    pub fn new(addr: SocketAddr, now: u64) -> Self {
        Self {
            id: NodeId::from_address(&addr),
            addr,
            last_seen: now,
            joined: now,
            session_key: None,
        }
    }

    pub fn to_tuple(&self) -> PeerTuple {
        (self.addr.ip().to_string(), self.addr.port(), self.last_seen)
    }
}

impl Keyed for PeerRecord {
    fn key(&self) -> &NodeId {
        &self.id
    }

    fn last_seen(&self) -> u64 {
        self.last_seen
    }

    fn touch(&mut self, now: u64) {
        self.last_seen = now;
    }
}

impl From<PeerRecord> for PeerTuple {
    fn from(record: PeerRecord) -> Self {
        record.to_tuple()
    }
}

impl TryFrom<PeerTuple> for PeerRecord {
    type Error = RecordError;

    fn try_from((host, port, last_seen): PeerTuple) -> Result<Self, Self::Error> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| RecordError::InvalidAddress { host: host.clone(), port })?;
        let mut record = PeerRecord::new(SocketAddr::new(ip, port), last_seen);
        record.joined = last_seen;
        Ok(record)
    }
}

impl fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRecord")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("last_seen", &self.last_seen)
            .field("joined", &self.joined)
            .field("session_key", &self.session_key.map(|_| "<redacted>"))
            .finish()
    }
}

/// Wire form of a file descriptor: `[content_id, owner, filename, size, published_on]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileTuple(pub NodeId, pub NodeId, pub String, pub u64, pub u64);

/// Descriptor of a published file, stored in the storage table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "FileTuple", from = "FileTuple")]
pub struct FileRecord {
    pub content_id: NodeId,
    pub owner: NodeId,
    pub filename: String,
    pub size: u64,
    pub published_on: u64,
}

impl FileRecord {
    pub fn new(owner: NodeId, filename: impl Into<String>, contents: &[u8], now: u64) -> Self {
        Self {
            content_id: NodeId::from_content(contents),
            owner,
            filename: filename.into(),
            size: contents.len() as u64,
            published_on: now,
        }
    }
}

impl Keyed for FileRecord {
    fn key(&self) -> &NodeId {
        &self.content_id
    }

    fn last_seen(&self) -> u64 {
        self.published_on
    }
}

impl From<FileRecord> for FileTuple {
    fn from(file: FileRecord) -> Self {
        FileTuple(file.content_id, file.owner, file.filename, file.size, file.published_on)
    }
}

impl From<FileTuple> for FileRecord {
    fn from(FileTuple(content_id, owner, filename, size, published_on): FileTuple) -> Self {
        Self {
            content_id,
            owner,
            filename,
            size,
            published_on,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_wire_form() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let peer = PeerRecord::new(addr, 1_700_000_000);

        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(json, r#"["127.0.0.1",9001,1700000000]"#);

        let decoded: PeerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id, peer.id);
        assert_eq!(decoded.addr, addr);
    }

    #[test]
    fn test_peer_bad_host_rejected() {
        let result = serde_json::from_str::<PeerRecord>(r#"["not-an-ip",9001,0]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_staleness() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let mut peer = PeerRecord::new(addr, 1_000);

        assert!(!peer.is_older_than(3600, 2_000));
        assert!(peer.is_older_than(3600, 10_000));

        peer.touch(9_000);
        assert!(!peer.is_older_than(3600, 10_000));

        // Never-seen records are not considered stale.
        peer.last_seen = 0;
        assert!(!peer.is_older_than(3600, 10_000));
    }

    #[test]
    fn test_file_descriptor_wire_form() {
        let owner = NodeId::random();
        let file = FileRecord::new(owner, "notes.txt", b"hello", 42);

        assert_eq!(file.content_id, NodeId::from_content(b"hello"));
        assert_eq!(file.size, 5);

        let json = serde_json::to_string(&file).unwrap();
        assert!(json.starts_with(&format!("[\"{}\",\"{}\"", file.content_id, owner)));
        let decoded: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, file);
    }
}

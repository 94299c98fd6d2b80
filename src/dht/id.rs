use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::convert::TryFrom;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

/// Length of a node identifier in bytes (160 bits).
pub const ID_LENGTH: usize = 20;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid hex in node id: {0}")]
    InvalidHex(String),

    #[error("Invalid length: expected 20 bytes, got {0}")]
    InvalidLength(usize),
}

/// A 160-bit identifier for peers and stored values.
///
/// Ordering is the numeric order of the big-endian value, which is the same
/// as comparing the fixed-length hex renderings.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; ID_LENGTH]);

impl NodeId {
    /// Derives the id of a peer from its listening address.
    pub fn from_address(addr: &SocketAddr) -> Self {
        Self::from_content(format!("{}:{}", addr.ip(), addr.port()).as_bytes())
    }

    /// SHA-1 of arbitrary content; used for content ids of published files.
    pub fn from_content(content: &[u8]) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, content);
        let mut id = [0u8; ID_LENGTH];
        id.copy_from_slice(digest.as_ref());
        Self(id)
    }

    /// Generates a random NodeId
    pub fn random() -> Self {
        let mut id = [0u8; ID_LENGTH];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut id);
        Self(id)
    }

    /// Calculates the XOR distance between two NodeIds
    pub fn distance(&self, other: &Self) -> Distance {
        let mut result = [0u8; ID_LENGTH];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// Fixed-length (40 character) lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = IdError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != ID_LENGTH {
            return Err(IdError::InvalidLength(bytes.len()));
        }

        let mut id = [0u8; ID_LENGTH];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| IdError::InvalidHex(s.to_string()))?;
        Self::try_from(bytes.as_slice())
    }
}

// Ids travel as hex strings inside the JSON payloads.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// XOR distance between two ids, interpreted as a big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; ID_LENGTH]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_last(byte: u8) -> NodeId {
        let mut bytes = [0u8; ID_LENGTH];
        bytes[ID_LENGTH - 1] = byte;
        NodeId(bytes)
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_to_self() {
        let a = NodeId::random();
        let b = NodeId::random();

        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&a).is_zero());
    }

    #[test]
    fn test_distance_ordering() {
        let target = id_with_last(0b0000_0100);
        let near = id_with_last(0b0000_0101);
        let far = id_with_last(0b0000_0000);

        assert!(target.distance(&near) < target.distance(&far));
    }

    #[test]
    fn test_hex_roundtrip_and_ordering() {
        let low: NodeId = "00000000000000000000000000000000000000ff".parse().unwrap();
        let high: NodeId = "0100000000000000000000000000000000000000".parse().unwrap();

        assert_eq!(low.to_string().len(), 40);
        assert!(low < high);
        assert_eq!(low.to_string().parse::<NodeId>().unwrap(), low);
    }

    #[test]
    fn test_invalid_ids_rejected() {
        assert_eq!("abcd".parse::<NodeId>(), Err(IdError::InvalidLength(2)));
        assert!(matches!("zz".parse::<NodeId>(), Err(IdError::InvalidHex(_))));
    }

    #[test]
    fn test_address_ids_are_stable() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:9002".parse().unwrap();

        assert_eq!(NodeId::from_address(&addr), NodeId::from_address(&addr));
        assert_ne!(NodeId::from_address(&addr), NodeId::from_address(&other));
    }

    #[test]
    fn test_content_id_is_sha1() {
        // SHA-1("abc")
        let id = NodeId::from_content(b"abc");
        assert_eq!(id.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}

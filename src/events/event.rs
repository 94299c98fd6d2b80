use serde::{Deserialize, Serialize};
use std::fmt;

/// A signed chat message. `hash`, `prev_hash` and `nonce` are filled in
/// when the event is mined into a chain.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub data: String,
    pub signature: Vec<u8>,
    pub hash: Option<String>,
    pub prev_hash: Option<String>,
    pub nonce: Option<u64>,
}

impl Event {
    pub fn new(data: impl Into<String>, signature: Vec<u8>) -> Self {
        Self {
            data: data.into(),
            signature,
            hash: None,
            prev_hash: None,
            nonce: None,
        }
    }

    pub fn is_mined(&self) -> bool {
        self.hash.is_some() && self.nonce.is_some()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("data", &self.data)
            .field("signature", &hex::encode(&self.signature[..self.signature.len().min(8)]))
            .field("hash", &self.hash)
            .field("prev_hash", &self.prev_hash)
            .field("nonce", &self.nonce)
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hash {
            Some(hash) => write!(f, "{} {}", hash, self.data),
            None => write!(f, "(unmined) {}", self.data),
        }
    }
}

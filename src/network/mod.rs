pub mod codec;
mod peer;

pub use codec::{
    encode_frame, open_envelope, seal_envelope, EventMessage, FrameAssembler, KeyExchangeRequest, MsgType,
    Payload,
};
pub use peer::{recv_frame, send_frame, RemotePeer, Reply, Transport, MAX_DATAGRAM};

use crate::crypto::{EncryptionError, KeyExchangeError};
use thiserror::Error;

/// 网络错误
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Frame error: {0}")]
    FrameError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Encryption error: {0}")]
    EncryptionError(#[from] EncryptionError),

    #[error("Key exchange error: {0}")]
    KeyExchangeError(#[from] KeyExchangeError),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::DecodeError(e.to_string())
    }
}

impl From<base64::DecodeError> for NetworkError {
    fn from(e: base64::DecodeError) -> Self {
        NetworkError::DecodeError(e.to_string())
    }
}

/*
 * Network layer for Beacon
 *
 * Every logical message is a length-prefixed frame split over UDP
 * datagrams. An exchange is two frames each way: a clear Diffie-Hellman
 * handshake that yields the session key, then one AES-GCM sealed
 * envelope per direction.
 */

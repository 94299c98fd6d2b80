use crate::crypto::{self, Sealed};
use crate::network::NetworkError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Size of the big-endian length prefix that opens every frame.
pub const LENGTH_PREFIX: usize = 4;

/// Upper bound on a declared frame length; larger frames are dropped.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Found,
    NotFound,
    Ping,
    Pong,
    FindNode,
    FindValue,
    GetValue,
    Store,
    Stored,
    Event,
}

impl MsgType {
    /// Header tag carried in the envelope (and bound as associated data).
    pub fn tag(&self) -> &'static str {
        match self {
            MsgType::Found => "0",
            MsgType::NotFound => "1",
            MsgType::Ping => "2",
            MsgType::Pong => "3",
            MsgType::FindNode => "4",
            MsgType::FindValue => "5",
            MsgType::GetValue => "6",
            MsgType::Store => "7",
            MsgType::Stored => "8",
            MsgType::Event => "9",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        let msg_type = match tag {
            "0" => MsgType::Found,
            "1" => MsgType::NotFound,
            "2" => MsgType::Ping,
            "3" => MsgType::Pong,
            "4" => MsgType::FindNode,
            "5" => MsgType::FindValue,
            "6" => MsgType::GetValue,
            "7" => MsgType::Store,
            "8" => MsgType::Stored,
            "9" => MsgType::Event,
            _ => return None,
        };
        Some(msg_type)
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgType::Found => "FOUND",
            MsgType::NotFound => "NOT_FOUND",
            MsgType::Ping => "PING",
            MsgType::Pong => "PONG",
            MsgType::FindNode => "FIND_NODE",
            MsgType::FindValue => "FIND_VALUE",
            MsgType::GetValue => "GET_VALUE",
            MsgType::Store => "STORE",
            MsgType::Stored => "STORED",
            MsgType::Event => "EVENT",
        };
        f.write_str(name)
    }
}

/// Splits a body into the datagrams of one frame: the 4-byte length prefix
/// on its own, then the body in chunks of at most `buffer_size` bytes.
pub fn encode_frame(body: &[u8], buffer_size: usize) -> Result<Vec<Vec<u8>>, NetworkError> {
    if body.len() > MAX_FRAME_LENGTH {
        return Err(NetworkError::FrameError(format!("body of {} bytes is too large", body.len())));
    }

    let length = body.len() as u32;
    let mut datagrams = vec![length.to_be_bytes().to_vec()];
    datagrams.extend(body.chunks(buffer_size.max(1)).map(<[u8]>::to_vec));
    Ok(datagrams)
}

/// Reassembles frames from consecutive datagrams of one sender.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    expected: Option<usize>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one datagram. Returns the body once the declared length has
    /// been reached; bytes past it are kept for the next frame.
    pub fn push(&mut self, datagram: &[u8]) -> Result<Option<Vec<u8>>, NetworkError> {
        self.buffer.extend_from_slice(datagram);

        if self.expected.is_none() {
            if self.buffer.len() < LENGTH_PREFIX {
                return Ok(None);
            }

            let mut prefix = [0u8; LENGTH_PREFIX];
            prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX]);
            let length = u32::from_be_bytes(prefix) as usize;
            self.buffer.drain(..LENGTH_PREFIX);

            if length > MAX_FRAME_LENGTH {
                self.reset();
                return Err(NetworkError::FrameError(format!("declared length {} is too large", length)));
            }
            self.expected = Some(length);
        }

        match self.expected {
            Some(length) if self.buffer.len() >= length => {
                let rest = self.buffer.split_off(length);
                let body = std::mem::replace(&mut self.buffer, rest);
                self.expected = None;
                Ok(Some(body))
            }
            _ => Ok(None),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.expected.is_none() && self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected = None;
    }
}

/// Encrypted message body: every field base64, the whole JSON base64 again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: String,
    pub header: String,
    pub ciphertext: String,
    pub tag: String,
}

/// Seals `plaintext` under the session key with the header as associated
/// data and returns the encoded body.
pub fn seal_envelope(key: &[u8; 32], header: MsgType, plaintext: &[u8]) -> Result<Vec<u8>, NetworkError> {
    let sealed = crypto::seal(key, header.tag().as_bytes(), plaintext)?;
    let envelope = Envelope {
        nonce: STANDARD.encode(&sealed.nonce),
        header: STANDARD.encode(header.tag()),
        ciphertext: STANDARD.encode(&sealed.ciphertext),
        tag: STANDARD.encode(&sealed.tag),
    };

    let json = serde_json::to_vec(&envelope)?;
    Ok(STANDARD.encode(json).into_bytes())
}

/// Reverses [`seal_envelope`]. Fails on malformed encoding, an unknown
/// header or a tag mismatch.
pub fn open_envelope(key: &[u8; 32], body: &[u8]) -> Result<(MsgType, Vec<u8>), NetworkError> {
    let json = STANDARD.decode(body)?;
    let envelope: Envelope = serde_json::from_slice(&json)?;

    let header = STANDARD.decode(&envelope.header)?;
    let sealed = Sealed {
        nonce: STANDARD.decode(&envelope.nonce)?,
        ciphertext: STANDARD.decode(&envelope.ciphertext)?,
        tag: STANDARD.decode(&envelope.tag)?,
    };
    let plaintext = crypto::open(key, &header, &sealed)?;

    let tag = String::from_utf8(header).map_err(|e| NetworkError::DecodeError(e.to_string()))?;
    let msg_type = MsgType::from_tag(&tag)
        .ok_or_else(|| NetworkError::DecodeError(format!("unknown header {:?}", tag)))?;
    Ok((msg_type, plaintext))
}

/// Plaintext of every request: the message plus the requester's
/// listening port, so the responder can reach it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub msg: String,
    #[serde(with = "port_string")]
    pub port: u16,
}

impl Payload {
    pub fn new(msg: impl Into<String>, port: u16) -> Self {
        Self { msg: msg.into(), port }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// Ports travel as decimal strings.
mod port_string {
    use super::*;

    pub fn serialize<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&port.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.trim().parse().map_err(serde::de::Error::custom)
    }
}

/// First frame of an exchange, sent in the clear. Numbers are decimal
/// strings since they do not fit a JSON number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeRequest {
    pub prime: String,
    pub pub_key: String,
}

impl KeyExchangeRequest {
    pub fn new(prime: &BigUint, pub_key: &BigUint) -> Self {
        Self {
            prime: prime.to_string(),
            pub_key: pub_key.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json).into_bytes())
    }

    pub fn decode(body: &[u8]) -> Result<Self, NetworkError> {
        let json = STANDARD.decode(body)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Body of an EVENT request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    pub msg: String,
    /// Base64 signature.
    pub sig: String,
}

impl EventMessage {
    pub fn new(data: &str, signature: &[u8]) -> Self {
        Self {
            msg: data.to_string(),
            sig: STANDARD.encode(signature),
        }
    }

    pub fn signature(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(STANDARD.decode(&self.sig)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_tags() {
        let all = [
            MsgType::Found,
            MsgType::NotFound,
            MsgType::Ping,
            MsgType::Pong,
            MsgType::FindNode,
            MsgType::FindValue,
            MsgType::GetValue,
            MsgType::Store,
            MsgType::Stored,
            MsgType::Event,
        ];
        for (i, msg_type) in all.iter().enumerate() {
            assert_eq!(msg_type.tag(), i.to_string());
            assert_eq!(MsgType::from_tag(msg_type.tag()), Some(*msg_type));
        }
        assert_eq!(MsgType::from_tag("x"), None);
    }

    #[test]
    fn test_frame_chunks_and_reassembly() {
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let datagrams = encode_frame(&body, 4096).unwrap();

        assert_eq!(datagrams.len(), 4);
        assert_eq!(datagrams[0], 10_000u32.to_be_bytes().to_vec());
        assert!(datagrams[1..].iter().all(|d| d.len() <= 4096));

        let mut assembler = FrameAssembler::new();
        let mut result = None;
        for datagram in &datagrams {
            assert!(result.is_none());
            result = assembler.push(datagram).unwrap();
        }
        assert_eq!(result, Some(body));
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_empty_body_completes_on_prefix() {
        let datagrams = encode_frame(b"", 4096).unwrap();
        assert_eq!(datagrams.len(), 1);

        let mut assembler = FrameAssembler::new();
        assert_eq!(assembler.push(&datagrams[0]).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_oversized_declaration_rejected() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.push(&u32::MAX.to_be_bytes()).is_err());
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_envelope() {
        let key = [7u8; 32];
        let payload = Payload::new("abc", 9001);
        let body = seal_envelope(&key, MsgType::FindNode, &payload.to_bytes().unwrap()).unwrap();

        let (header, plaintext) = open_envelope(&key, &body).unwrap();
        assert_eq!(header, MsgType::FindNode);
        assert_eq!(Payload::from_bytes(&plaintext).unwrap(), payload);

        assert!(open_envelope(&[8u8; 32], &body).is_err());
        assert!(open_envelope(&key, b"%%% not base64").is_err());
    }

    #[test]
    fn test_tampered_header_rejected() {
        let key = [1u8; 32];
        let body = seal_envelope(&key, MsgType::Ping, b"").unwrap();

        let json = STANDARD.decode(&body).unwrap();
        let mut envelope: Envelope = serde_json::from_slice(&json).unwrap();
        envelope.header = STANDARD.encode(MsgType::Store.tag());
        let forged = STANDARD.encode(serde_json::to_vec(&envelope).unwrap()).into_bytes();

        assert!(open_envelope(&key, &forged).is_err());
    }

    #[test]
    fn test_payload_port_is_a_string() {
        let json = String::from_utf8(Payload::new("", 9001).to_bytes().unwrap()).unwrap();
        assert_eq!(json, r#"{"msg":"","port":"9001"}"#);
        assert!(Payload::from_bytes(br#"{"msg":"","port":"99999"}"#).is_err());
    }

    #[test]
    fn test_key_exchange_request() {
        let request = KeyExchangeRequest::new(&BigUint::from(23u8), &BigUint::from(5u8));
        let decoded = KeyExchangeRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.prime, "23");
    }
}

use ed25519_dalek::{Keypair, PublicKey, SecretKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Key deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// The ed25519 key pair a node signs its chat events with.
pub struct SigningKeyPair {
    keypair: Keypair,
}

impl SigningKeyPair {
    /// Generates a new random key pair
    pub fn generate() -> Result<Self, KeyError> {
        // 生成随机字节作为秘钥
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        rand::Rng::fill(&mut rand::thread_rng(), &mut seed);
        Self::from_seed(&seed).map_err(|e| KeyError::GenerationFailed(e.to_string()))
    }

    /// Rebuilds a key pair from its 32-byte secret seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, KeyError> {
        let secret = SecretKey::from_bytes(seed)
            .map_err(|e| KeyError::DeserializationFailed(e.to_string()))?;
        let public = PublicKey::from(&secret);
        Ok(Self {
            keypair: Keypair { secret, public },
        })
    }

    /// Loads a hex-encoded seed written by [`SigningKeyPair::save`].
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let contents = fs::read_to_string(path)?;
        let seed = hex::decode(contents.trim())
            .map_err(|e| KeyError::DeserializationFailed(e.to_string()))?;
        Self::from_seed(&seed)
    }

    pub fn save(&self, path: &Path) -> Result<(), KeyError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, hex::encode(self.keypair.secret.as_bytes()))?;
        Ok(())
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    /// Hex form used for `trusted_public_key` in the configuration.
    pub fn public_hex(&self) -> String {
        hex::encode(self.keypair.public.as_bytes())
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKeyPair({}...)", &self.public_hex()[0..8])
    }
}

/// Parses a hex-encoded ed25519 public key.
pub fn parse_public_key(value: &str) -> Result<PublicKey, KeyError> {
    let bytes = hex::decode(value.trim()).map_err(|e| KeyError::DeserializationFailed(e.to_string()))?;
    if bytes.len() != PUBLIC_KEY_LENGTH {
        return Err(KeyError::DeserializationFailed(format!(
            "Expected {} bytes, got {}",
            PUBLIC_KEY_LENGTH,
            bytes.len()
        )));
    }
    PublicKey::from_bytes(&bytes).map_err(|e| KeyError::DeserializationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("signing.key");

        let keys = SigningKeyPair::generate().unwrap();
        keys.save(&path).unwrap();

        let loaded = SigningKeyPair::load(&path).unwrap();
        assert_eq!(loaded.public_hex(), keys.public_hex());
    }

    #[test]
    fn test_parse_public_key() {
        let keys = SigningKeyPair::generate().unwrap();
        let parsed = parse_public_key(&keys.public_hex()).unwrap();
        assert_eq!(parsed.as_bytes(), keys.public_key().as_bytes());

        assert!(parse_public_key("abcd").is_err());
        assert!(parse_public_key("not hex").is_err());
    }

    #[test]
    fn test_bad_seed_length() {
        assert!(SigningKeyPair::from_seed(&[1u8; 16]).is_err());
    }
}

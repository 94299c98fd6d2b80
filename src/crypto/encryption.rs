use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use rand::RngCore;
use thiserror::Error;

pub const NONCE_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Output of [`seal`]: the tag is kept apart from the ciphertext because
/// the envelope carries them as separate fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

/// AES-256-GCM with a fresh random nonce; `aad` is authenticated but not encrypted.
pub fn seal(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Sealed, EncryptionError> {
    // 生成随机nonce
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
        .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

    Ok(Sealed {
        nonce: nonce.to_vec(),
        ciphertext: buffer,
        tag: tag.to_vec(),
    })
}

/// Verifies the tag and decrypts. Any tampering with nonce, aad,
/// ciphertext or tag fails.
pub fn open(key: &[u8; 32], aad: &[u8], sealed: &Sealed) -> Result<Vec<u8>, EncryptionError> {
    // 检查nonce和tag长度，from_slice在长度不符时会panic
    if sealed.nonce.len() != NONCE_LENGTH {
        return Err(EncryptionError::InvalidParameters(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LENGTH,
            sealed.nonce.len()
        )));
    }
    if sealed.tag.len() != TAG_LENGTH {
        return Err(EncryptionError::InvalidParameters(format!(
            "tag must be {} bytes, got {}",
            TAG_LENGTH,
            sealed.tag.len()
        )));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut buffer = sealed.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            aad,
            &mut buffer,
            Tag::from_slice(&sealed.tag),
        )
        .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_seal_open() {
        let key = key();
        let sealed = seal(&key, b"4", b"{\"msg\":\"hello\",\"port\":\"9001\"}").unwrap();

        assert_eq!(sealed.nonce.len(), NONCE_LENGTH);
        assert_eq!(sealed.tag.len(), TAG_LENGTH);
        assert_eq!(open(&key, b"4", &sealed).unwrap(), b"{\"msg\":\"hello\",\"port\":\"9001\"}");
    }

    #[test]
    fn test_nonces_differ() {
        let key = key();
        let a = seal(&key, b"2", b"").unwrap();
        let b = seal(&key, b"2", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_single_bit_corruption_is_detected() {
        let key = key();
        let sealed = seal(&key, b"7", b"some payload").unwrap();

        let mut bad_ciphertext = sealed.clone();
        bad_ciphertext.ciphertext[0] ^= 0x01;
        assert!(matches!(open(&key, b"7", &bad_ciphertext), Err(EncryptionError::DecryptionFailed(_))));

        let mut bad_tag = sealed.clone();
        bad_tag.tag[15] ^= 0x80;
        assert!(open(&key, b"7", &bad_tag).is_err());

        // Header is bound as associated data.
        assert!(open(&key, b"8", &sealed).is_err());

        assert!(open(&self::key(), b"7", &sealed).is_err());
    }

    #[test]
    fn test_malformed_lengths_rejected() {
        let key = key();
        let mut sealed = seal(&key, b"0", b"x").unwrap();
        sealed.nonce.pop();
        assert!(matches!(open(&key, b"0", &sealed), Err(EncryptionError::InvalidParameters(_))));
    }
}

use crate::crypto::SigningKeyPair;
use ed25519_dalek::{PublicKey, Signature, Signer, Verifier, SIGNATURE_LENGTH};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Invalid signature length: {0}")]
    InvalidLength(usize),
}

/// 生成消息摘要（哈希）
pub fn hash_message(message: &[u8]) -> Vec<u8> {
    let digest = ring::digest::digest(&ring::digest::SHA256, message);
    digest.as_ref().to_vec()
}

/// Signs the SHA-256 digest of `message`.
pub fn sign_hashed(keys: &SigningKeyPair, message: &[u8]) -> Vec<u8> {
    keys.keypair().sign(&hash_message(message)).to_bytes().to_vec()
}

/// Verifies a signature produced by [`sign_hashed`].
pub fn verify_hashed(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(SignatureError::InvalidLength(signature.len()));
    }

    let signature = Signature::try_from(signature)
        .map_err(|e| SignatureError::VerificationFailed(e.to_string()))?;

    public_key
        .verify(&hash_message(message), &signature)
        .map_err(|e| SignatureError::VerificationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_hashed() {
        let keys = SigningKeyPair::generate().unwrap();
        let message = b"hello from 127.0.0.1:9001";

        let signature = sign_hashed(&keys, message);
        assert_eq!(signature.len(), SIGNATURE_LENGTH);
        assert!(verify_hashed(keys.public_key(), message, &signature).is_ok());

        // 更改消息应导致验证失败
        assert!(verify_hashed(keys.public_key(), b"hello from somewhere else", &signature).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = SigningKeyPair::generate().unwrap();
        let other = SigningKeyPair::generate().unwrap();

        let signature = sign_hashed(&signer, b"event");
        assert!(verify_hashed(other.public_key(), b"event", &signature).is_err());
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let keys = SigningKeyPair::generate().unwrap();
        let signature = sign_hashed(&keys, b"event");
        assert_eq!(
            verify_hashed(keys.public_key(), b"event", &signature[..10]),
            Err(SignatureError::InvalidLength(10))
        );
    }
}

mod encryption;
mod key_exchange;
mod keys;
mod signing;

pub use encryption::{open, seal, EncryptionError, Sealed, NONCE_LENGTH, TAG_LENGTH};
pub use key_exchange::{parse_decimal, DhGroup, EphemeralKey, KeyExchangeError, PRIME_BITS};
pub use keys::{parse_public_key, KeyError, SigningKeyPair};
pub use signing::{hash_message, sign_hashed, verify_hashed, SignatureError};

/*
 * Cryptography module for Beacon
 *
 * This module handles all cryptographic operations including:
 * - Ephemeral Diffie-Hellman agreement of per-exchange session keys
 * - AES-256-GCM sealing of message payloads
 * - Ed25519 signatures over chat events
 */

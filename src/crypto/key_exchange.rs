use num_bigint::{BigUint, RandBigInt};
use thiserror::Error;

/// Required size of the Diffie-Hellman modulus.
pub const PRIME_BITS: u64 = 1024;

/// 1024-bit MODP group from RFC 2409 (Oakley group 2).
const OAKLEY_GROUP_2: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyExchangeError {
    #[error("Invalid prime: expected {expected} bits, got {actual}")]
    InvalidPrime { expected: u64, actual: u64 },

    #[error("Invalid generator: {0}")]
    InvalidGenerator(String),

    #[error("Invalid public value")]
    InvalidPublicValue,

    #[error("Malformed number: {0}")]
    MalformedNumber(String),
}

/// Finite-field group parameters shared by both ends of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    prime: BigUint,
    generator: BigUint,
}

impl DhGroup {
    pub fn new(prime: BigUint, generator: u64) -> Result<Self, KeyExchangeError> {
        if prime.bits() != PRIME_BITS {
            return Err(KeyExchangeError::InvalidPrime {
                expected: PRIME_BITS,
                actual: prime.bits(),
            });
        }

        let generator = BigUint::from(generator);
        if generator < BigUint::from(2u8) || generator >= prime {
            return Err(KeyExchangeError::InvalidGenerator(generator.to_string()));
        }

        Ok(Self { prime, generator })
    }

    /// The built-in group with the given generator.
    pub fn oakley(generator: u64) -> Result<Self, KeyExchangeError> {
        Self::from_hex(OAKLEY_GROUP_2, generator)
    }

    pub fn from_hex(prime_hex: &str, generator: u64) -> Result<Self, KeyExchangeError> {
        let prime = BigUint::parse_bytes(prime_hex.trim().as_bytes(), 16)
            .ok_or_else(|| KeyExchangeError::MalformedNumber(prime_hex.to_string()))?;
        Self::new(prime, generator)
    }

    /// Rebuilds the group an initiator announced. Only the prime travels on
    /// the wire, so the generator comes from local configuration.
    pub fn from_decimal(prime: &str, generator: u64) -> Result<Self, KeyExchangeError> {
        Self::new(parse_decimal(prime)?, generator)
    }

    pub fn prime(&self) -> &BigUint {
        &self.prime
    }

    /// Picks a private exponent of `key_length` random bytes and computes
    /// the matching public value.
    pub fn generate(&self, key_length: usize) -> EphemeralKey {
        let bits = (key_length.max(1) * 8) as u64;
        let private = rand::thread_rng().gen_biguint(bits);
        let public = self.generator.modpow(&private, &self.prime);
        EphemeralKey { private, public }
    }

    /// A remote public value must lie in `[2, p - 2]`.
    pub fn check_public(&self, value: &BigUint) -> Result<(), KeyExchangeError> {
        let two = BigUint::from(2u8);
        if *value < two || *value > &self.prime - &two {
            return Err(KeyExchangeError::InvalidPublicValue);
        }
        Ok(())
    }
}

/// One side's ephemeral key pair; dropped after the exchange completes.
pub struct EphemeralKey {
    private: BigUint,
    public: BigUint,
}

impl EphemeralKey {
    pub fn public(&self) -> &BigUint {
        &self.public
    }

    /// Public value as raw big-endian bytes, the form the responder sends back.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_bytes_be()
    }

    /// SHA-256 of the shared value `remote ^ private mod p`.
    pub fn derive_session_key(&self, group: &DhGroup, remote: &BigUint) -> Result<[u8; 32], KeyExchangeError> {
        group.check_public(remote)?;

        let shared = remote.modpow(&self.private, &group.prime);
        let digest = ring::digest::digest(&ring::digest::SHA256, &shared_value_bytes(&shared));

        let mut key = [0u8; 32];
        key.copy_from_slice(digest.as_ref());
        Ok(key)
    }
}

// Width is bit_length / 8 + 1, so a value whose top byte is full gets a
// leading zero byte. Both ends must agree on this before hashing.
fn shared_value_bytes(value: &BigUint) -> Vec<u8> {
    let mut bytes = value.to_bytes_be();
    if value.bits() % 8 == 0 {
        bytes.insert(0, 0);
    }
    bytes
}

pub fn parse_decimal(value: &str) -> Result<BigUint, KeyExchangeError> {
    BigUint::parse_bytes(value.trim().as_bytes(), 10)
        .ok_or_else(|| KeyExchangeError::MalformedNumber(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_the_same_key() {
        let group = DhGroup::oakley(2).unwrap();
        let initiator = group.generate(32);
        let responder = group.generate(32);

        let a = initiator.derive_session_key(&group, responder.public()).unwrap();
        let b = responder.derive_session_key(&group, initiator.public()).unwrap();
        assert_eq!(a, b);

        let other = group.generate(32);
        let c = other.derive_session_key(&group, initiator.public()).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_wire_forms() {
        let group = DhGroup::oakley(2).unwrap();
        let key = group.generate(16);

        let rebuilt = DhGroup::from_decimal(&group.prime().to_string(), 2).unwrap();
        assert_eq!(rebuilt, group);
        assert_eq!(&BigUint::from_bytes_be(&key.public_bytes()), key.public());
    }

    #[test]
    fn test_rejects_wrong_prime_size() {
        let small = BigUint::from(23u8);
        assert_eq!(
            DhGroup::new(small, 5),
            Err(KeyExchangeError::InvalidPrime { expected: 1024, actual: 5 })
        );
        assert!(DhGroup::from_decimal("not a number", 2).is_err());
    }

    #[test]
    fn test_rejects_degenerate_public_values() {
        let group = DhGroup::oakley(2).unwrap();
        let key = group.generate(32);

        assert!(key.derive_session_key(&group, &BigUint::from(1u8)).is_err());
        let p_minus_one = group.prime() - BigUint::from(1u8);
        assert!(key.derive_session_key(&group, &p_minus_one).is_err());
    }

    #[test]
    fn test_shared_value_padding() {
        assert_eq!(shared_value_bytes(&BigUint::from(0x7fu8)), vec![0x7f]);
        assert_eq!(shared_value_bytes(&BigUint::from(0xffu8)), vec![0x00, 0xff]);
    }
}

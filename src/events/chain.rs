use crate::dht::ID_LENGTH;
use crate::events::Event;
use thiserror::Error;

/// Link value used in place of a previous hash for the first event.
pub const GENESIS_PREV_HASH: &str = "0000000000000000000000000000000000000000";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChainError {
    #[error("Invalid difficulty {0}: must be between 1 and 9")]
    InvalidDifficulty(usize),

    #[error("Event is not mined")]
    NotMined,

    #[error("Broken link at event {index}")]
    BrokenLink { index: usize },

    #[error("Invalid proof of work at event {index}")]
    InvalidProof { index: usize },

    #[error("Miner queue is full")]
    QueueFull,

    #[error("Miner has stopped")]
    MinerStopped,
}

/// Exclusive bounds of the accepted hash values for a difficulty `d`:
/// both start with `d` repeated `d` times; the rest is `d + 1` (as a hex
/// digit) for the lower bound and `f` for the upper one.
pub fn target_range(difficulty: usize) -> Result<([u8; ID_LENGTH], [u8; ID_LENGTH]), ChainError> {
    if !(1..=9).contains(&difficulty) {
        return Err(ChainError::InvalidDifficulty(difficulty));
    }

    let width = ID_LENGTH * 2;
    let prefix = difficulty.to_string().repeat(difficulty);
    let min_fill = format!("{:x}", difficulty + 1).repeat(width - difficulty);
    let max_fill = "f".repeat(width - difficulty);

    Ok((
        decode_target(&format!("{}{}", prefix, min_fill), difficulty)?,
        decode_target(&format!("{}{}", prefix, max_fill), difficulty)?,
    ))
}

fn decode_target(hex_value: &str, difficulty: usize) -> Result<[u8; ID_LENGTH], ChainError> {
    let mut target = [0u8; ID_LENGTH];
    hex::decode_to_slice(hex_value, &mut target).map_err(|_| ChainError::InvalidDifficulty(difficulty))?;
    Ok(target)
}

fn proof_digest(event: &Event, nonce: u64) -> [u8; ID_LENGTH] {
    let prev_hash = event.prev_hash.as_deref().unwrap_or(GENESIS_PREV_HASH);

    let mut context = ring::digest::Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY);
    context.update(event.data.as_bytes());
    context.update(&event.signature);
    context.update(prev_hash.as_bytes());
    context.update(&nonce.to_be_bytes());

    let mut digest = [0u8; ID_LENGTH];
    digest.copy_from_slice(context.finish().as_ref());
    digest
}

/// Searches nonces from zero until the SHA-1 over
/// `data ‖ signature ‖ prev_hash ‖ nonce` falls strictly inside the target
/// range, then records the winning hash and nonce on the event.
pub fn mine(event: &mut Event, difficulty: usize) -> Result<(), ChainError> {
    let (min_target, max_target) = target_range(difficulty)?;

    let mut nonce: u64 = 0;
    loop {
        let digest = proof_digest(event, nonce);
        if min_target < digest && digest < max_target {
            event.hash = Some(hex::encode(digest));
            event.nonce = Some(nonce);
            return Ok(());
        }
        nonce = nonce.wrapping_add(1);
    }
}

/// Checks a mined event's recorded hash against its contents.
pub fn check_proof(event: &Event, difficulty: usize) -> Result<bool, ChainError> {
    let (hash, nonce) = match (&event.hash, event.nonce) {
        (Some(hash), Some(nonce)) => (hash, nonce),
        _ => return Err(ChainError::NotMined),
    };

    let (min_target, max_target) = target_range(difficulty)?;
    let digest = proof_digest(event, nonce);
    Ok(hex::encode(digest) == *hash && min_target < digest && digest < max_target)
}

/// Append-only log of mined events. The first entry is the head and each
/// later one links to its predecessor's hash.
#[derive(Debug, Clone)]
pub struct EventChain {
    events: Vec<Event>,
    difficulty: usize,
}

impl EventChain {
    pub fn new(difficulty: usize) -> Result<Self, ChainError> {
        target_range(difficulty)?;
        Ok(Self {
            events: Vec::new(),
            difficulty,
        })
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn head(&self) -> Option<&Event> {
        self.events.first()
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Hash the next event must link to.
    pub fn last_hash(&self) -> Option<String> {
        self.last().and_then(|event| event.hash.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Links `event` to the tail, mines it on the calling thread and
    /// appends it. Run this off the receive path.
    pub fn add(&mut self, mut event: Event) -> Result<&Event, ChainError> {
        event.prev_hash = self.last_hash();
        mine(&mut event, self.difficulty)?;
        self.events.push(event);
        self.last().ok_or(ChainError::NotMined)
    }

    /// Appends an event mined elsewhere. It must link to the current tail
    /// and carry a valid proof.
    pub fn append_mined(&mut self, event: Event) -> Result<(), ChainError> {
        let index = self.events.len();
        if event.prev_hash != self.last_hash() {
            return Err(ChainError::BrokenLink { index });
        }
        if !check_proof(&event, self.difficulty)? {
            return Err(ChainError::InvalidProof { index });
        }

        self.events.push(event);
        Ok(())
    }

    /// Walks from the head checking every link and proof.
    pub fn verify(&self) -> Result<(), ChainError> {
        let mut prev_hash: Option<&String> = None;
        for (index, event) in self.events.iter().enumerate() {
            if event.prev_hash.as_ref() != prev_hash {
                return Err(ChainError::BrokenLink { index });
            }
            if !check_proof(event, self.difficulty)? {
                return Err(ChainError::InvalidProof { index });
            }
            prev_hash = event.hash.as_ref();
        }
        Ok(())
    }
}

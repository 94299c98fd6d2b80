pub mod chain;
mod event;
mod miner;

pub use chain::{check_proof, mine, target_range, ChainError, EventChain, GENESIS_PREV_HASH};
pub use event::Event;
pub use miner::Miner;

/*
 * Event chain for Beacon
 *
 * Chat lines travel as signed events. A receiver checks the signature
 * against the trusted key, floods the event to a few peers and appends it
 * to its local chain after a proof-of-work step that rate-limits appends.
 */

pub mod id;
pub mod kbucket;
pub mod record;
pub mod ring;

pub use id::{Distance, IdError, NodeId, ID_LENGTH};
pub use kbucket::KBucket;
pub use record::{FileRecord, FileTuple, Keyed, PeerRecord, PeerTuple, RecordError};
pub use ring::{AddOutcome, RoutingRing};

/*
 * Distributed Hash Table (DHT) data structures for Beacon
 *
 * Two tables are built from the same pieces:
 *
 * 1. Routing table - peers, keyed by SHA-1 of their "ip:port"
 * 2. Storage table - published file descriptors, keyed by content hash
 *
 * Each table is a ring of k-buckets sorted by root id. A k-bucket is a
 * binary search tree holding at most k records; full buckets split in two.
 */

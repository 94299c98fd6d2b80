pub mod cli;
pub mod crypto;
pub mod dht;
pub mod events;
pub mod network;
pub mod node;
pub mod utils;

pub use dht::NodeId;
pub use node::{DhtError, LocalNode, Node};
pub use utils::Config;

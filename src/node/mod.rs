mod handlers;
mod lookup;
pub mod snapshot;

pub use lookup::StoreReport;

use crate::crypto::{parse_public_key, DhGroup, KeyError, KeyExchangeError, SigningKeyPair};
use crate::dht::{FileRecord, NodeId, PeerRecord, PeerTuple, RoutingRing};
use crate::events::{ChainError, Event, EventChain, Miner};
use crate::network::{NetworkError, RemotePeer, Transport};
use crate::utils::{Config, ConfigError};
use ed25519_dalek::PublicKey;
use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Network error: {0}")]
    NetworkError(#[from] NetworkError),

    #[error("No known peers to query")]
    NoKnownPeers,

    #[error("Value not found: {0}")]
    NotFound(NodeId),

    #[error("Owner {0} is unreachable")]
    OwnerUnreachable(NodeId),

    #[error("Integrity violation: expected {expected}, got {actual}")]
    IntegrityViolation { expected: NodeId, actual: NodeId },

    #[error("No signing key configured")]
    NoSigningKey,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Chain error: {0}")]
    ChainError(#[from] ChainError),

    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Key error: {0}")]
    KeyError(#[from] KeyError),

    #[error("Key exchange error: {0}")]
    KeyExchangeError(#[from] KeyExchangeError),
}

/// What the local node and a remote peer have in common.
pub trait Node {
    fn id(&self) -> &NodeId;

    fn address(&self) -> SocketAddr;

    fn wire_tuple(&self, last_seen: u64) -> PeerTuple {
        let addr = self.address();
        (addr.ip().to_string(), addr.port(), last_seen)
    }
}

impl Node for RemotePeer {
    fn id(&self) -> &NodeId {
        RemotePeer::id(self)
    }

    fn address(&self) -> SocketAddr {
        self.addr()
    }
}

/// A verified chat line received from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub from: NodeId,
    pub text: String,
}

/// The node this process runs: owns the listening socket, the routing and
/// storage tables and the event chain.
pub struct LocalNode {
    id: NodeId,
    addr: SocketAddr,
    config: Arc<Config>,
    socket: UdpSocket,
    transport: Transport,

    routing: Mutex<RoutingRing<PeerRecord>>,
    storage: Mutex<RoutingRing<FileRecord>>,

    chain: Arc<Mutex<EventChain>>,
    miner: Miner,
    /// Signature of the most recently admitted event, for duplicate
    /// suppression. Only the latest is kept: two events flooding at the
    /// same time can alternate through it and be admitted again.
    last_admitted: Mutex<Option<Vec<u8>>>,

    /// Files this node published, by content id.
    published: RwLock<HashMap<NodeId, PathBuf>>,

    trusted_key: Option<PublicKey>,
    signer: Option<SigningKeyPair>,
    chat_tx: broadcast::Sender<ChatLine>,
}

impl LocalNode {
    /// Binds the listening socket on `bind_host:port` (0 picks a free
    /// port). The id comes from the advertised address, not the bound
    /// one. The signing key comes from `signing_key_path` if set.
    pub async fn bind(config: Config, port: u16) -> Result<Arc<Self>, DhtError> {
        let signer = match &config.signing_key_path {
            Some(path) => Some(SigningKeyPair::load(path)?),
            None => None,
        };
        Self::bind_with_signer(config, port, signer).await
    }

    pub async fn bind_with_signer(
        config: Config,
        port: u16,
        signer: Option<SigningKeyPair>,
    ) -> Result<Arc<Self>, DhtError> {
        config.validate()?;

        let socket = UdpSocket::bind(SocketAddr::new(config.bind_host, port)).await?;
        // 通告地址，节点ID由其计算，与对端计算的一致
        let addr = SocketAddr::new(config.advertised_ip(), socket.local_addr()?.port());
        let id = NodeId::from_address(&addr);

        let group = match &config.dh_prime {
            Some(prime) => DhGroup::from_hex(prime, config.generator)?,
            None => DhGroup::oakley(config.generator)?,
        };
        let transport = Transport::new(&config, group, addr.port());

        let trusted_key = match &config.trusted_public_key {
            Some(key) => Some(parse_public_key(key)?),
            None => None,
        };

        let chain = Arc::new(Mutex::new(EventChain::new(config.mining_difficulty)?));
        let (miner, _) = Miner::spawn(chain.clone(), config.miner_queue);
        let (chat_tx, _) = broadcast::channel(64);

        info!("Node {} bound to {}", id, addr);

        Ok(Arc::new(Self {
            id,
            addr,
            routing: Mutex::new(RoutingRing::new(config.k_nodes, Some(config.stale_peer_secs))),
            storage: Mutex::new(RoutingRing::new(config.k_nodes, None)),
            config: Arc::new(config),
            socket,
            transport,
            chain,
            miner,
            last_admitted: Mutex::new(None),
            published: RwLock::new(HashMap::new()),
            trusted_key,
            signer,
            chat_tx,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn signer(&self) -> Option<&SigningKeyPair> {
        self.signer.as_ref()
    }

    /// Receives every verified chat line from now on.
    pub fn subscribe_chat(&self) -> broadcast::Receiver<ChatLine> {
        self.chat_tx.subscribe()
    }

    /// Starts the service loop and the snapshot task.
    pub fn start(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        (self.serve(), self.spawn_snapshot_task())
    }

    pub async fn peers(&self) -> Vec<PeerRecord> {
        let routing = self.routing.lock().await;
        routing.list_nodes().into_iter().cloned().collect()
    }

    /// Whether `addr` is this node, by address or by the id it hashes to.
    pub fn is_self(&self, addr: &SocketAddr) -> bool {
        *addr == self.addr || NodeId::from_address(addr) == self.id
    }

    pub async fn knows_peer(&self, id: &NodeId) -> bool {
        self.routing.lock().await.contains(id)
    }

    pub async fn stored_files(&self) -> Vec<FileRecord> {
        let storage = self.storage.lock().await;
        storage.list_nodes().into_iter().cloned().collect()
    }

    /// A copy of the local event chain, head first.
    pub async fn events(&self) -> Vec<Event> {
        self.chain.lock().await.iter().cloned().collect()
    }
}

impl Node for LocalNode {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn address(&self) -> SocketAddr {
        self.addr
    }
}

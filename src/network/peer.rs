use crate::crypto::DhGroup;
use crate::dht::{FileRecord, NodeId, PeerTuple};
use crate::network::codec::{
    encode_frame, open_envelope, seal_envelope, EventMessage, FrameAssembler, KeyExchangeRequest, MsgType,
    Payload,
};
use crate::network::NetworkError;
use crate::utils::config::Config;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::debug;
use num_bigint::BigUint;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Receive buffer size; large enough for any datagram a peer may send.
pub const MAX_DATAGRAM: usize = 65_535;

/// 出站请求的共享上下文
#[derive(Debug, Clone)]
pub struct Transport {
    /// 本地绑定地址
    bind_host: IpAddr,

    /// 本节点的监听端口，随每个请求发送
    local_port: u16,

    buffer_size: usize,

    /// 私钥长度（字节）
    key_length: usize,

    request_timeout: Duration,

    group: DhGroup,
}

impl Transport {
    pub fn new(config: &Config, group: DhGroup, local_port: u16) -> Self {
        Self {
            bind_host: config.bind_host,
            local_port,
            buffer_size: config.buffer_size,
            key_length: config.dh_key_length,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            group,
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    pub fn group(&self) -> &DhGroup {
        &self.group
    }

    /// A handle for talking to the node listening on `addr`.
    pub fn peer(&self, addr: SocketAddr) -> RemotePeer {
        RemotePeer {
            id: NodeId::from_address(&addr),
            addr,
            transport: self.clone(),
        }
    }
}

/// Sends one frame: the length prefix datagram, then the body chunks.
pub async fn send_frame(socket: &UdpSocket, to: SocketAddr, body: &[u8], buffer_size: usize) -> Result<(), NetworkError> {
    for datagram in encode_frame(body, buffer_size)? {
        socket.send_to(&datagram, to).await?;
    }
    Ok(())
}

/// Receives one frame from `from`, ignoring datagrams of other senders.
pub async fn recv_frame(socket: &UdpSocket, from: SocketAddr) -> Result<Vec<u8>, NetworkError> {
    let mut assembler = FrameAssembler::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;
        if src != from {
            debug!("Ignoring datagram from {} while waiting on {}", src, from);
            continue;
        }

        if let Some(body) = assembler.push(&buf[..len])? {
            return Ok(body);
        }
    }
}

/// Decrypted answer to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub header: MsgType,
    pub msg: String,
}

/// A remote node seen through the transport. Every request runs on its
/// own ephemeral socket: handshake frame, sealed request, sealed reply.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    id: NodeId,
    addr: SocketAddr,
    transport: Transport,
}

impl RemotePeer {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn handshake(&self, socket: &UdpSocket) -> Result<[u8; 32], NetworkError> {
        let group = self.transport.group();
        let key = group.generate(self.transport.key_length);

        let request = KeyExchangeRequest::new(group.prime(), key.public());
        send_frame(socket, self.addr, &request.encode()?, self.transport.buffer_size).await?;

        let response = recv_frame(socket, self.addr).await?;
        let remote = BigUint::from_bytes_be(&response);
        Ok(key.derive_session_key(group, &remote)?)
    }

    async fn run_exchange(&self, header: MsgType, msg: &str, expect_reply: bool) -> Result<Option<Reply>, NetworkError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.transport.bind_host, 0)).await?;
        let session_key = self.handshake(&socket).await?;

        let payload = Payload::new(msg, self.transport.local_port);
        let body = seal_envelope(&session_key, header, &payload.to_bytes()?)?;
        send_frame(&socket, self.addr, &body, self.transport.buffer_size).await?;
        debug!("Sent {} to {}", header, self.addr);

        if !expect_reply {
            return Ok(None);
        }

        let body = recv_frame(&socket, self.addr).await?;
        let (header, plaintext) = open_envelope(&session_key, &body)?;
        let msg = String::from_utf8(plaintext).map_err(|e| NetworkError::DecodeError(e.to_string()))?;
        debug!("Received {} from {}", header, self.addr);
        Ok(Some(Reply { header, msg }))
    }

    async fn exchange(&self, header: MsgType, msg: &str, expect_reply: bool) -> Result<Option<Reply>, NetworkError> {
        match timeout(self.transport.request_timeout, self.run_exchange(header, msg, expect_reply)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout),
        }
    }

    /// Sends a request and waits for the reply.
    pub async fn request(&self, header: MsgType, msg: &str) -> Result<Reply, NetworkError> {
        self.exchange(header, msg, true)
            .await?
            .ok_or_else(|| NetworkError::UnexpectedReply(format!("no reply to {}", header)))
    }

    /// Liveness probe. Any failure counts as "not alive".
    pub async fn ping(&self) -> bool {
        match self.request(MsgType::Ping, "").await {
            Ok(reply) => reply.header == MsgType::Pong,
            Err(e) => {
                debug!("Ping to {} failed: {}", self.addr, e);
                false
            }
        }
    }

    /// Asks the peer for the nodes it knows near `target`.
    pub async fn find_node(&self, target: &NodeId) -> Result<Vec<SocketAddr>, NetworkError> {
        let reply = self.request(MsgType::FindNode, &target.to_hex()).await?;
        if reply.header != MsgType::Found {
            return Err(NetworkError::UnexpectedReply(reply.header.to_string()));
        }

        let tuples: Vec<PeerTuple> = serde_json::from_str(&reply.msg)?;
        let mut addrs = Vec::with_capacity(tuples.len());
        for (host, port, _) in tuples {
            match host.parse::<IpAddr>() {
                // A node bound to the wildcard address reports it as its own
                // host; reach it where it answered from instead.
                Ok(ip) if ip.is_unspecified() => addrs.push(SocketAddr::new(self.addr.ip(), port)),
                Ok(ip) => addrs.push(SocketAddr::new(ip, port)),
                Err(_) => debug!("Skipping malformed peer host {:?} from {}", host, self.addr),
            }
        }
        Ok(addrs)
    }

    /// Looks `key` up in the peer's storage table.
    pub async fn find_value(&self, key: &NodeId) -> Result<Option<FileRecord>, NetworkError> {
        let reply = self.request(MsgType::FindValue, &key.to_hex()).await?;
        match reply.header {
            MsgType::Found => Ok(Some(serde_json::from_str(&reply.msg)?)),
            MsgType::NotFound => Ok(None),
            other => Err(NetworkError::UnexpectedReply(other.to_string())),
        }
    }

    /// Fetches the content of a file the peer published.
    pub async fn get_value(&self, content_id: &NodeId) -> Result<Option<Vec<u8>>, NetworkError> {
        let reply = self.request(MsgType::GetValue, &content_id.to_hex()).await?;
        match reply.header {
            MsgType::Found => Ok(Some(STANDARD.decode(reply.msg.as_bytes())?)),
            MsgType::NotFound => Ok(None),
            other => Err(NetworkError::UnexpectedReply(other.to_string())),
        }
    }

    /// Pushes a file descriptor into the peer's storage table.
    pub async fn store(&self, file: &FileRecord) -> Result<bool, NetworkError> {
        let reply = self.request(MsgType::Store, &serde_json::to_string(file)?).await?;
        Ok(reply.header == MsgType::Stored)
    }

    /// Forwards a signed event. The receiver never replies.
    pub async fn send_event(&self, data: &str, signature: &[u8]) -> Result<(), NetworkError> {
        let message = serde_json::to_string(&EventMessage::new(data, signature))?;
        self.exchange(MsgType::Event, &message, false).await?;
        Ok(())
    }
}

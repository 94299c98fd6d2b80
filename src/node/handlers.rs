use crate::crypto::{parse_decimal, verify_hashed, DhGroup};
use crate::dht::{AddOutcome, NodeId, PeerRecord};
use crate::events::{ChainError, Event};
use crate::network::{
    open_envelope, seal_envelope, send_frame, EventMessage, FrameAssembler, KeyExchangeRequest, MsgType,
    NetworkError, Payload, MAX_DATAGRAM,
};
use crate::node::{ChatLine, DhtError, LocalNode, Node};
use crate::utils::unix_now;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Per-sender state between the handshake frame and the request frame.
struct Session {
    assembler: FrameAssembler,
    key: Option<[u8; 32]>,
    started: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            assembler: FrameAssembler::new(),
            key: None,
            started: Instant::now(),
        }
    }
}

impl LocalNode {
    /// Spawns the receive loop. Exchanges are handled one frame at a time;
    /// a bad datagram only ends its own exchange.
    pub fn serve(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move { node.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let session_ttl = Duration::from_secs(self.config.request_timeout_secs.max(1));

        info!("Listening on {}", self.addr);

        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("Receive failed: {}", e);
                    continue;
                }
            };

            sessions.retain(|_, session| session.started.elapsed() < session_ttl);

            let (body, key) = {
                let session = sessions.entry(src).or_insert_with(Session::new);
                match session.assembler.push(&buf[..len]) {
                    Ok(Some(body)) => (body, session.key),
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("Dropping exchange with {}: {}", src, e);
                        sessions.remove(&src);
                        continue;
                    }
                }
            };

            match key {
                None => match self.accept_key_exchange(src, &body).await {
                    Ok(key) => {
                        if let Some(session) = sessions.get_mut(&src) {
                            session.key = Some(key);
                        }
                    }
                    Err(e) => {
                        debug!("Key exchange with {} failed: {}", src, e);
                        sessions.remove(&src);
                    }
                },
                Some(key) => {
                    sessions.remove(&src);
                    if let Err(e) = self.dispatch(src, &key, &body).await {
                        debug!("Discarded message from {}: {}", src, e);
                    }
                }
            }
        }
    }

    /// Responder half of the handshake: validates the announced group,
    /// answers with the raw public value and returns the session key.
    async fn accept_key_exchange(&self, src: SocketAddr, body: &[u8]) -> Result<[u8; 32], NetworkError> {
        let request = KeyExchangeRequest::decode(body)?;
        let group = DhGroup::from_decimal(&request.prime, self.config.generator)?;
        let remote = parse_decimal(&request.pub_key)?;

        let key = group.generate(self.transport.key_length());
        let session_key = key.derive_session_key(&group, &remote)?;

        send_frame(&self.socket, src, &key.public_bytes(), self.config.buffer_size).await?;
        Ok(session_key)
    }

    async fn reply(&self, to: SocketAddr, key: &[u8; 32], header: MsgType, msg: &str) -> Result<(), NetworkError> {
        let body = seal_envelope(key, header, msg.as_bytes())?;
        send_frame(&self.socket, to, &body, self.config.buffer_size).await?;
        debug!("Replied {} to {}", header, to);
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, src: SocketAddr, key: &[u8; 32], body: &[u8]) -> Result<(), DhtError> {
        let (header, plaintext) = open_envelope(key, body)?;
        let payload = Payload::from_bytes(&plaintext)?;
        // Replies go to the ephemeral source; callbacks go to the declared port.
        let requester = SocketAddr::new(src.ip(), payload.port);
        debug!("{} from {}", header, requester);

        match header {
            MsgType::Ping => {
                self.reply(src, key, MsgType::Pong, "").await?;
                self.spawn_admit(requester);
            }
            MsgType::FindNode => {
                let target = parse_id(&payload.msg)?;
                let tuples = self.closest_tuples(&target).await;
                self.reply(src, key, MsgType::Found, &serde_json::to_string(&tuples).map_err(NetworkError::from)?)
                    .await?;
                self.spawn_admit(requester);
            }
            MsgType::FindValue => {
                let found = match payload.msg.parse::<NodeId>() {
                    Ok(key) => self.storage.lock().await.find_node(&key).cloned(),
                    Err(_) => None,
                };
                match found {
                    Some(file) => {
                        let json = serde_json::to_string(&file).map_err(NetworkError::from)?;
                        self.reply(src, key, MsgType::Found, &json).await?;
                    }
                    None => self.reply(src, key, MsgType::NotFound, "").await?,
                }
            }
            MsgType::GetValue => match self.read_published(&payload.msg).await {
                Some(contents) => self.reply(src, key, MsgType::Found, &STANDARD.encode(contents)).await?,
                None => self.reply(src, key, MsgType::NotFound, "").await?,
            },
            MsgType::Store => {
                let file = serde_json::from_str(&payload.msg).map_err(NetworkError::from)?;
                self.storage.lock().await.add_node(file, unix_now());
                self.reply(src, key, MsgType::Stored, "").await?;
            }
            MsgType::Event => self.accept_event(requester, &payload.msg).await?,
            other => debug!("Ignoring unexpected {} from {}", other, src),
        }

        Ok(())
    }

    /// Tuples of the bucket closest to `target` plus this node's own.
    async fn closest_tuples(&self, target: &NodeId) -> Vec<crate::dht::PeerTuple> {
        let now = unix_now();
        let routing = self.routing.lock().await;
        let mut tuples: Vec<_> = routing
            .find_closest_bucket(target)
            .map(|bucket| bucket.preorder().into_iter().map(PeerRecord::to_tuple).collect())
            .unwrap_or_default();
        tuples.push(self.wire_tuple(now));
        tuples
    }

    async fn read_published(&self, content_id: &str) -> Option<Vec<u8>> {
        let content_id = content_id.parse::<NodeId>().ok()?;
        let path = self.published.read().await.get(&content_id).cloned()?;
        match tokio::fs::read(&path).await {
            Ok(contents) => Some(contents),
            Err(e) => {
                warn!("Published file {} is unreadable: {}", path.display(), e);
                None
            }
        }
    }

    fn spawn_admit(self: &Arc<Self>, addr: SocketAddr) {
        let node = self.clone();
        tokio::spawn(async move {
            node.admit_peer(addr).await;
        });
    }

    /// Adds a contacted peer to the routing table, or refreshes it when
    /// already known. A full bucket with a stale oldest entry pings that
    /// entry without holding the table lock. Returns whether the peer was
    /// newly inserted.
    pub async fn admit_peer(&self, addr: SocketAddr) -> bool {
        if self.is_self(&addr) {
            return false;
        }

        let now = unix_now();
        let record = PeerRecord::new(addr, now);
        let outcome = {
            let mut routing = self.routing.lock().await;
            if routing.touch(&record.id, now) {
                return false;
            }
            routing.add_node(record, now)
        };

        match outcome {
            AddOutcome::Inserted | AddOutcome::Split => {
                debug!("Added peer {}", addr);
                true
            }
            AddOutcome::Duplicate => false,
            AddOutcome::ProbeOldest { oldest, candidate } => {
                let alive = self.transport.peer(oldest.addr).ping().await;
                let now = unix_now();

                let mut routing = self.routing.lock().await;
                if alive {
                    routing.touch(&oldest.id, now);
                } else {
                    info!("Evicting unresponsive peer {}", oldest.addr);
                }
                !matches!(
                    routing.resolve_probe(&oldest.id, candidate, alive, now),
                    AddOutcome::Duplicate
                )
            }
        }
    }

    /// EVENT handling: drop repeats, verify against the trusted key, then
    /// flood and queue for mining. Never replies.
    async fn accept_event(self: &Arc<Self>, sender: SocketAddr, msg: &str) -> Result<(), DhtError> {
        let message: EventMessage = serde_json::from_str(msg).map_err(NetworkError::from)?;
        let signature = message.signature()?;

        {
            let mut last_admitted = self.last_admitted.lock().await;
            let tail_signature = self.chain.lock().await.last().map(|event| event.signature.clone());
            if last_admitted.as_deref() == Some(signature.as_slice())
                || tail_signature.as_deref() == Some(signature.as_slice())
            {
                debug!("Duplicate event from {}", sender);
                return Ok(());
            }

            let trusted_key = match &self.trusted_key {
                Some(key) => key,
                None => {
                    warn!("Rejected event from {}: no trusted key configured", sender);
                    return Ok(());
                }
            };
            if let Err(e) = verify_hashed(trusted_key, message.msg.as_bytes(), &signature) {
                warn!("Rejected event from {}: {}", sender, e);
                return Ok(());
            }

            *last_admitted = Some(signature.clone());
        }

        let from = NodeId::from_address(&sender);
        info!("{} {}", from, message.msg);
        let _ = self.chat_tx.send(ChatLine {
            from,
            text: message.msg.clone(),
        });

        self.broadcast(&message.msg, &signature, Some(sender)).await;

        match self.miner.try_submit(Event::new(message.msg, signature)) {
            Ok(()) => Ok(()),
            Err(ChainError::QueueFull) => {
                warn!("Miner queue full, dropping event from {}", sender);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_id(value: &str) -> Result<NodeId, DhtError> {
    value
        .parse()
        .map_err(|e: crate::dht::IdError| NetworkError::DecodeError(e.to_string()).into())
}

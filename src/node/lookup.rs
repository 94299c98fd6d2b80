use crate::crypto::sign_hashed;
use crate::dht::{FileRecord, KBucket, NodeId, PeerRecord};
use crate::events::Event;
use crate::node::{snapshot, DhtError, LocalNode};
use crate::utils::unix_now;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::path::Path;
use tokio::task::JoinSet;

/// Result of publishing a file.
#[derive(Debug, Clone)]
pub struct StoreReport {
    pub file: FileRecord,
    /// Peers that acknowledged the descriptor with STORED.
    pub replicas: usize,
}

impl LocalNode {
    /// Iterative FIND_NODE towards `target`, seeded from the closest known
    /// peer. Returns the nearest bucket found, `None` when no peer answered.
    pub async fn find_node(&self, target: &NodeId) -> Result<Option<KBucket<PeerRecord>>, DhtError> {
        let candidates = self.seed_candidates(target).await;
        if candidates.is_empty() {
            return Err(DhtError::NoKnownPeers);
        }

        for boot in candidates {
            if let Some(bucket) = self.find_node_via(target, boot).await {
                return Ok(Some(bucket));
            }
        }
        Ok(None)
    }

    /// Seeds the table from `boot` with a lookup of this node's own id.
    pub async fn bootstrap(&self, boot: SocketAddr) -> Option<KBucket<PeerRecord>> {
        info!("Bootstrapping via {}", boot);
        let target = self.id;
        self.find_node_via(&target, boot).await
    }

    /// The closest peer of the closest bucket first, then the rest of that
    /// bucket by distance.
    async fn seed_candidates(&self, target: &NodeId) -> Vec<SocketAddr> {
        let routing = self.routing.lock().await;
        let mut candidates: Vec<SocketAddr> = routing.find_closest(target).map(|p| p.addr).into_iter().collect();
        if let Some(bucket) = routing.find_closest_bucket(target) {
            for peer in bucket.find_alpha_closest(target, self.config.alpha) {
                if !candidates.contains(&peer.addr) {
                    candidates.push(peer.addr);
                }
            }
        }
        candidates
    }

    async fn find_node_via(&self, target: &NodeId, boot: SocketAddr) -> Option<KBucket<PeerRecord>> {
        let boot_peer = self.transport.peer(boot);
        let scratch_capacity = self.config.k_nodes + 1;

        // First round: the boot peer's view, every other entry ping-checked.
        let addrs = match boot_peer.find_node(target).await {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("FIND_NODE via {} failed: {}", boot, e);
                return None;
            }
        };
        self.admit_peer(boot).await;

        let others: Vec<SocketAddr> = addrs
            .iter()
            .copied()
            .filter(|addr| *addr != boot && !self.is_self(addr))
            .collect();
        let alive = self.ping_all(others).await;
        for addr in &alive {
            self.admit_peer(*addr).await;
        }

        let now = unix_now();
        let mut nearest_bucket = KBucket::new(scratch_capacity);
        for addr in addrs {
            if addr == boot || alive.contains(&addr) {
                nearest_bucket.add(PeerRecord::new(addr, now));
            }
        }

        // Refinement: ask the alpha closest of the current best bucket and
        // keep going while the best distance strictly shrinks.
        loop {
            let nearest = nearest_bucket.find_closest(target)?.id;
            if nearest == *boot_peer.id() {
                return Some(nearest_bucket);
            }

            let original = nearest.distance(target);
            let mut best = original;
            let mut best_bucket = None;

            let queried: Vec<SocketAddr> = nearest_bucket
                .find_alpha_closest(target, self.config.alpha)
                .into_iter()
                .filter(|peer| peer.addr != boot)
                .map(|peer| peer.addr)
                .collect();
            let answers = self.query_all(target, &queried).await;

            // Only peers not yet in the table are checked, all at once.
            let mut fresh = Vec::new();
            for addr in answers.iter().flatten() {
                let id = NodeId::from_address(addr);
                if !self.is_self(addr) && !fresh.contains(addr) && !self.knows_peer(&id).await {
                    fresh.push(*addr);
                }
            }
            let alive = self.ping_all(fresh).await;
            for addr in &alive {
                self.admit_peer(*addr).await;
            }

            for learned_addrs in answers {
                let mut learned = KBucket::new(scratch_capacity);
                for addr in learned_addrs.into_iter().filter(|addr| alive.contains(addr)) {
                    learned.add(PeerRecord::new(addr, unix_now()));
                }

                if let Some(closest) = learned.find_closest(target) {
                    let distance = closest.id.distance(target);
                    if distance < best {
                        best = distance;
                        best_bucket = Some(learned);
                    }
                }
            }

            match best_bucket {
                Some(bucket) if best < original => nearest_bucket = bucket,
                _ => return Some(nearest_bucket),
            }
        }
    }

    /// FIND_NODE to every address concurrently. Answers come back in the
    /// order of `addrs`; peers that failed are left out.
    async fn query_all(&self, target: &NodeId, addrs: &[SocketAddr]) -> Vec<Vec<SocketAddr>> {
        let mut join_set = JoinSet::new();
        for (idx, addr) in addrs.iter().enumerate() {
            let peer = self.transport.peer(*addr);
            let target = *target;
            join_set.spawn(async move { (idx, peer.find_node(&target).await) });
        }

        let mut answers: Vec<Option<Vec<SocketAddr>>> = vec![None; addrs.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, Ok(learned))) => answers[idx] = Some(learned),
                Ok((idx, Err(e))) => debug!("FIND_NODE via {} failed: {}", addrs[idx], e),
                Err(e) => warn!("FIND_NODE task failed: {}", e),
            }
        }
        answers.into_iter().flatten().collect()
    }

    /// Pings every address concurrently; returns those that answered, in
    /// their original order.
    async fn ping_all(&self, addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
        let mut join_set = JoinSet::new();
        for (idx, addr) in addrs.iter().enumerate() {
            let peer = self.transport.peer(*addr);
            join_set.spawn(async move { (idx, peer.ping().await) });
        }

        let mut alive = vec![false; addrs.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, answered)) => alive[idx] = answered,
                Err(e) => warn!("Ping task failed: {}", e),
            }
        }
        addrs
            .into_iter()
            .zip(alive)
            .filter_map(|(addr, answered)| answered.then_some(addr))
            .collect()
    }

    /// Startup join: the explicit boot address if given, otherwise the
    /// addresses of the last snapshot, otherwise the configured backup
    /// hosts. Returns whether some peer answered.
    pub async fn join(&self, boot: Option<SocketAddr>) -> bool {
        if let Some(addr) = boot {
            return self.try_bootstrap(addr).await;
        }

        let path = self.snapshot_path();
        match snapshot::read_snapshot(&path) {
            Ok(addrs) => {
                for addr in addrs {
                    if !self.is_self(&addr) && self.try_bootstrap(addr).await {
                        return true;
                    }
                }
            }
            Err(e) => debug!("No usable snapshot at {}: {}", path.display(), e),
        }

        for addr in self.config.backup_addrs() {
            if self.try_bootstrap(addr).await {
                return true;
            }
        }

        warn!("Could not join the network; waiting for peers to contact us");
        false
    }

    async fn try_bootstrap(&self, addr: SocketAddr) -> bool {
        match self.bootstrap(addr).await {
            Some(bucket) if !bucket.is_empty() => {
                info!("Joined via {} ({} peers known)", addr, self.routing.lock().await.node_count());
                true
            }
            _ => {
                debug!("Bootstrap via {} failed", addr);
                false
            }
        }
    }

    /// FIND_VALUE: local storage first, then the peers of the nearest
    /// bucket in pre-order. The content is fetched from the owner and must
    /// hash to the content id.
    pub async fn find_value(&self, key: &NodeId) -> Result<Vec<u8>, DhtError> {
        let local = self.storage.lock().await.find_node(key).cloned();
        let file = match local {
            Some(file) => file,
            None => {
                let file = self.query_descriptor(key).await?;
                self.storage.lock().await.add_node(file.clone(), unix_now());
                file
            }
        };

        let content = if file.owner == self.id {
            let path = self.published.read().await.get(&file.content_id).cloned();
            match path {
                Some(path) => tokio::fs::read(path).await?,
                None => return Err(DhtError::NotFound(*key)),
            }
        } else {
            let owner = self.resolve_owner(&file.owner).await?;
            self.transport
                .peer(owner)
                .get_value(&file.content_id)
                .await?
                .ok_or(DhtError::NotFound(*key))?
        };

        let actual = NodeId::from_content(&content);
        if actual != file.content_id {
            return Err(DhtError::IntegrityViolation {
                expected: file.content_id,
                actual,
            });
        }
        Ok(content)
    }

    async fn query_descriptor(&self, key: &NodeId) -> Result<FileRecord, DhtError> {
        let bucket = self.find_node(key).await?.ok_or(DhtError::NotFound(*key))?;

        for peer in bucket.preorder() {
            if self.is_self(&peer.addr) {
                continue;
            }
            match self.transport.peer(peer.addr).find_value(key).await {
                Ok(Some(file)) if file.content_id == *key => return Ok(file),
                Ok(_) => continue,
                Err(e) => debug!("FIND_VALUE via {} failed: {}", peer.addr, e),
            }
        }
        Err(DhtError::NotFound(*key))
    }

    /// Address of the peer with id `owner`: from the table, else by lookup.
    async fn resolve_owner(&self, owner: &NodeId) -> Result<SocketAddr, DhtError> {
        if let Some(peer) = self.routing.lock().await.find_node(owner) {
            return Ok(peer.addr);
        }

        let bucket = self.find_node(owner).await?;
        if let Some(peer) = bucket.as_ref().and_then(|bucket| bucket.find(owner)) {
            return Ok(peer.addr);
        }
        self.routing
            .lock()
            .await
            .find_node(owner)
            .map(|peer| peer.addr)
            .ok_or(DhtError::OwnerUnreachable(*owner))
    }

    /// STORE: publishes a local file. The descriptor is kept locally and
    /// pushed to every peer of the bucket nearest its content id.
    pub async fn store(&self, path: &Path) -> Result<StoreReport, DhtError> {
        let contents = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let now = unix_now();
        let file = FileRecord::new(self.id, filename, &contents, now);
        self.published.write().await.insert(file.content_id, path.to_path_buf());
        self.storage.lock().await.add_node(file.clone(), now);

        let bucket = match self.find_node(&file.content_id).await {
            Ok(bucket) => bucket,
            Err(DhtError::NoKnownPeers) => None,
            Err(e) => return Err(e),
        };

        let mut replicas = 0;
        if let Some(bucket) = bucket {
            for peer in bucket.preorder() {
                if self.is_self(&peer.addr) {
                    continue;
                }
                match self.transport.peer(peer.addr).store(&file).await {
                    Ok(true) => replicas += 1,
                    Ok(false) => debug!("{} did not confirm STORE", peer.addr),
                    Err(e) => debug!("STORE to {} failed: {}", peer.addr, e),
                }
            }
        }

        info!("Published {} as {} ({} replicas)", file.filename, file.content_id, replicas);
        Ok(StoreReport { file, replicas })
    }

    /// Signs a chat line, queues it for mining and floods it.
    pub async fn broadcast_chat(&self, text: &str) -> Result<Event, DhtError> {
        let signer = self.signer.as_ref().ok_or(DhtError::NoSigningKey)?;
        let signature = sign_hashed(signer, text.as_bytes());
        let event = Event::new(text, signature.clone());

        *self.last_admitted.lock().await = Some(signature.clone());
        self.miner.submit(event.clone()).await?;
        let sent = self.broadcast(text, &signature, None).await;
        debug!("Chat event sent to {} peers", sent);
        Ok(event)
    }

    /// Sends an event to a random alpha-subset of known peers, skipping
    /// `exclude`. Sends run in the background; returns how many started.
    pub(crate) async fn broadcast(&self, data: &str, signature: &[u8], exclude: Option<SocketAddr>) -> usize {
        let peers: Vec<SocketAddr> = {
            let routing = self.routing.lock().await;
            routing
                .list_nodes()
                .into_iter()
                .map(|peer| peer.addr)
                .filter(|addr| Some(*addr) != exclude)
                .collect()
        };

        let chosen: Vec<SocketAddr> = peers
            .choose_multiple(&mut rand::thread_rng(), self.config.alpha)
            .copied()
            .collect();

        for addr in &chosen {
            let peer = self.transport.peer(*addr);
            let data = data.to_string();
            let signature = signature.to_vec();
            tokio::spawn(async move {
                if let Err(e) = peer.send_event(&data, &signature).await {
                    debug!("Event to {} failed: {}", peer.addr(), e);
                }
            });
        }
        chosen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::utils::Config;
    use std::time::{Duration, Instant};
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_silent_peers_are_pinged_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let config = || Config {
            request_timeout_secs: 1,
            snapshot_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let a = LocalNode::bind_with_signer(config(), 0, None).await.unwrap();
        let b = LocalNode::bind_with_signer(config(), 0, None).await.unwrap();
        let _ = a.serve();
        let _ = b.serve();

        // A hands these out but none of them ever answers.
        let mut silent = Vec::new();
        for _ in 0..4 {
            silent.push(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        }
        {
            let mut routing = a.routing.lock().await;
            for socket in &silent {
                routing.add_node(PeerRecord::new(socket.local_addr().unwrap(), unix_now()), unix_now());
            }
        }

        let started = Instant::now();
        let bucket = b.bootstrap(a.address()).await.unwrap();
        let elapsed = started.elapsed();

        assert!(bucket.contains(a.id()));
        assert_eq!(bucket.size(), 1);
        // One timeout for the whole batch, not one per peer.
        assert!(elapsed < Duration::from_millis(3500), "bootstrap took {:?}", elapsed);
        for socket in &silent {
            assert!(!b.knows_peer(&NodeId::from_address(&socket.local_addr().unwrap())).await);
        }
    }
}

use beacon::crypto::{DhGroup, SigningKeyPair};
use beacon::dht::NodeId;
use beacon::network::{encode_frame, recv_frame, seal_envelope, send_frame, KeyExchangeRequest, MsgType};
use beacon::node::{DhtError, LocalNode, Node};
use beacon::utils::Config;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;

/// Local test network helper: every node binds 127.0.0.1 on a free port.
struct TestNet {
    snapshots: TempDir,
}

impl TestNet {
    fn new() -> Self {
        Self {
            snapshots: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self, trusted: Option<&SigningKeyPair>) -> Config {
        Config {
            k_nodes: 4,
            mining_difficulty: 1,
            snapshot_dir: Some(self.snapshots.path().to_path_buf()),
            trusted_public_key: trusted.map(|key| key.public_hex()),
            ..Config::default()
        }
    }

    async fn spawn(&self, trusted: Option<&SigningKeyPair>, signer: Option<SigningKeyPair>) -> Arc<LocalNode> {
        self.spawn_with(self.config(trusted), signer).await
    }

    async fn spawn_with(&self, config: Config, signer: Option<SigningKeyPair>) -> Arc<LocalNode> {
        let node = LocalNode::bind_with_signer(config, 0, signer).await.unwrap();
        let _ = node.start();
        node
    }
}

async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_bootstrap_learns_the_boot_peer() {
    let net = TestNet::new();
    let a = net.spawn(None, None).await;
    let b = net.spawn(None, None).await;

    assert!(b.join(Some(a.address())).await);
    assert!(b.knows_peer(a.id()).await);

    // B's own lookup against A comes back with A in the bucket.
    let bucket = b.find_node(b.id()).await.unwrap().unwrap();
    assert!(bucket.contains(a.id()));

    // A admits B in the background after answering.
    let (a2, b_id) = (a.clone(), *b.id());
    assert!(wait_until(|| { let a = a2.clone(); async move { a.knows_peer(&b_id).await } }).await);
}

#[tokio::test]
async fn test_lone_node_has_no_peers_to_query() {
    let net = TestNet::new();
    let a = net.spawn(None, None).await;

    let target = NodeId::random();
    assert!(matches!(a.find_node(&target).await, Err(DhtError::NoKnownPeers)));
    assert!(!a.join(None).await);
}

#[tokio::test]
async fn test_upload_then_download_from_another_node() {
    let net = TestNet::new();
    let a = net.spawn(None, None).await;
    let b = net.spawn(None, None).await;
    assert!(b.join(Some(a.address())).await);

    let (a2, b_id) = (a.clone(), *b.id());
    assert!(wait_until(|| { let a = a2.clone(); async move { a.knows_peer(&b_id).await } }).await);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.txt");
    let contents = b"hello over udp\n".to_vec();
    std::fs::write(&path, &contents).unwrap();

    let report = a.store(&path).await.unwrap();
    assert_eq!(report.file.content_id, NodeId::from_content(&contents));
    assert_eq!(report.file.filename, "hello.txt");
    assert_eq!(report.replicas, 1);
    assert!(b.stored_files().await.iter().any(|file| file.content_id == report.file.content_id));

    let downloaded = b.find_value(&report.file.content_id).await.unwrap();
    assert_eq!(downloaded, contents);

    // The publisher serves its own files without the network.
    assert_eq!(a.find_value(&report.file.content_id).await.unwrap(), contents);
}

#[tokio::test]
async fn test_lone_upload_keeps_descriptor_locally() {
    let net = TestNet::new();
    let a = net.spawn(None, None).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("solo.bin");
    std::fs::write(&path, [1u8, 2, 3]).unwrap();

    let report = a.store(&path).await.unwrap();
    assert_eq!(report.replicas, 0);
    assert_eq!(a.stored_files().await.len(), 1);
    assert_eq!(a.find_value(&report.file.content_id).await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_changed_content_is_an_integrity_violation() {
    let net = TestNet::new();
    let a = net.spawn(None, None).await;
    let b = net.spawn(None, None).await;
    assert!(b.join(Some(a.address())).await);

    let (a2, b_id) = (a.clone(), *b.id());
    assert!(wait_until(|| { let a = a2.clone(); async move { a.knows_peer(&b_id).await } }).await);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mutable.txt");
    std::fs::write(&path, b"original").unwrap();
    let report = a.store(&path).await.unwrap();

    std::fs::write(&path, b"tampered").unwrap();
    match b.find_value(&report.file.content_id).await {
        Err(DhtError::IntegrityViolation { expected, actual }) => {
            assert_eq!(expected, report.file.content_id);
            assert_eq!(actual, NodeId::from_content(b"tampered"));
        }
        other => panic!("expected an integrity violation, got {:?}", other.map(|c| c.len())),
    }
}

#[tokio::test]
async fn test_unknown_key_is_not_found() {
    let net = TestNet::new();
    let a = net.spawn(None, None).await;
    let b = net.spawn(None, None).await;
    assert!(b.join(Some(a.address())).await);

    let missing = NodeId::from_content(b"nobody published this");
    assert!(matches!(b.find_value(&missing).await, Err(DhtError::NotFound(key)) if key == missing));
}

#[tokio::test]
async fn test_trusted_chat_event_reaches_the_other_chain() {
    let net = TestNet::new();
    let signer = SigningKeyPair::from_seed(&[42u8; 32]).unwrap();
    let a = net.spawn(Some(&signer), Some(SigningKeyPair::from_seed(&[42u8; 32]).unwrap())).await;
    let b = net.spawn(Some(&signer), None).await;
    assert!(b.join(Some(a.address())).await);

    let (a2, b_id) = (a.clone(), *b.id());
    assert!(wait_until(|| { let a = a2.clone(); async move { a.knows_peer(&b_id).await } }).await);

    let mut chat = b.subscribe_chat();
    a.broadcast_chat("hello everyone").await.unwrap();

    let line = tokio::time::timeout(Duration::from_secs(10), chat.recv()).await.unwrap().unwrap();
    assert_eq!(line.text, "hello everyone");

    for node in [&a, &b] {
        let node = node.clone();
        assert!(
            wait_until(|| {
                let node = node.clone();
                async move { node.events().await.len() == 1 }
            })
            .await
        );
        let events = node.events().await;
        assert_eq!(events[0].data, "hello everyone");
        assert!(events[0].is_mined());
    }
}

#[tokio::test]
async fn test_untrusted_chat_event_is_dropped() {
    let net = TestNet::new();
    let trusted = SigningKeyPair::from_seed(&[1u8; 32]).unwrap();
    let impostor = SigningKeyPair::from_seed(&[2u8; 32]).unwrap();

    let a = net.spawn(Some(&trusted), Some(impostor)).await;
    let b = net.spawn(Some(&trusted), None).await;
    assert!(b.join(Some(a.address())).await);

    let (a2, b_id) = (a.clone(), *b.id());
    assert!(wait_until(|| { let a = a2.clone(); async move { a.knows_peer(&b_id).await } }).await);

    let mut chat = b.subscribe_chat();
    a.broadcast_chat("let me in").await.unwrap();

    assert!(tokio::time::timeout(Duration::from_secs(2), chat.recv()).await.is_err());
    assert!(b.events().await.is_empty());
}

#[tokio::test]
async fn test_chat_without_signing_key_fails() {
    let net = TestNet::new();
    let a = net.spawn(None, None).await;
    assert!(matches!(a.broadcast_chat("hi").await, Err(DhtError::NoSigningKey)));
}

#[tokio::test]
async fn test_wildcard_bind_advertises_a_reachable_id() {
    let net = TestNet::new();
    let wildcard = || Config {
        bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        ..net.config(None)
    };
    let a = net.spawn_with(wildcard(), None).await;
    let b = net.spawn_with(wildcard(), None).await;

    assert_eq!(a.address().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(*a.id(), NodeId::from_address(&a.address()));

    assert!(b.join(Some(a.address())).await);
    assert!(b.knows_peer(a.id()).await);
    assert!(!b.knows_peer(b.id()).await);

    let (a2, b_id) = (a.clone(), *b.id());
    assert!(wait_until(|| { let a = a2.clone(); async move { a.knows_peer(&b_id).await } }).await);
    assert!(!a.knows_peer(a.id()).await);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wild.txt");
    std::fs::write(&path, b"bound everywhere").unwrap();

    let report = a.store(&path).await.unwrap();
    assert_eq!(report.replicas, 1);
    assert_eq!(b.find_value(&report.file.content_id).await.unwrap(), b"bound everywhere".to_vec());
}

#[tokio::test]
async fn test_bad_datagrams_do_not_stop_the_service_loop() {
    let net = TestNet::new();
    let a = net.spawn(None, None).await;
    let b = net.spawn(None, None).await;
    let target = a.address();

    // A handshake body that is not base64.
    let junk = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for datagram in encode_frame(b"%%% not base64 %%%", 4096).unwrap() {
        junk.send_to(&datagram, target).await.unwrap();
    }

    // A declared length beyond the frame limit.
    let oversized = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    oversized.send_to(&u32::MAX.to_be_bytes(), target).await.unwrap();

    // A length prefix whose body never arrives.
    let truncated = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    truncated.send_to(&100u32.to_be_bytes(), target).await.unwrap();

    // A valid handshake followed by an envelope sealed under the wrong key.
    let forger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let group = DhGroup::oakley(2).unwrap();
    let key = group.generate(32);
    let request = KeyExchangeRequest::new(group.prime(), key.public()).encode().unwrap();
    send_frame(&forger, target, &request, 4096).await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), recv_frame(&forger, target))
        .await
        .unwrap()
        .unwrap();
    assert!(!response.is_empty());
    let forged = seal_envelope(&[7u8; 32], MsgType::Ping, b"{\"msg\":\"\",\"port\":\"1\"}").unwrap();
    send_frame(&forger, target, &forged, 4096).await.unwrap();

    // The forged ping gets no answer.
    let mut buf = [0u8; 64];
    assert!(tokio::time::timeout(Duration::from_millis(500), forger.recv_from(&mut buf)).await.is_err());

    assert!(b.transport().peer(target).ping().await);
}

//! End-to-end tests: two in-process backends over loopback
//!
//! Run with: cargo test --test protocol_test -- --nocapture

use filament::config::{Config, SeedPeer};
use filament::external::MemoryUserBlockchain;
use filament::net::{Backend, BlockRange, BlockStreamRecord, Collaborators};
use std::sync::Arc;
use std::time::Duration;

/// Start a backend listening on an ephemeral loopback port.
async fn spawn_backend(seeds: Vec<SeedPeer>, collab: Collaborators) -> (Arc<Backend>, u16) {
    let config = Config {
        listen: vec!["127.0.0.1:0".into()],
        seed_list: seeds,
        ..Default::default()
    };
    let backend = Backend::init_with(config, collab).expect("init");
    backend.connect().await.expect("connect");
    let port = backend.networks.sockets(true).await[0].local_port;
    (backend, port)
}

fn seed_for(backend: &Arc<Backend>, port: u16) -> SeedPeer {
    SeedPeer {
        public_key: hex::encode(backend.identity.peer_id()),
        addresses: vec![format!("127.0.0.1:{port}")],
    }
}

/// Poll until the condition holds or the deadline passes.
async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn connected_pair() -> (Arc<Backend>, Arc<Backend>) {
    let (a, port_a) = spawn_backend(Vec::new(), Collaborators::default()).await;
    let (b, _) = spawn_backend(vec![seed_for(&a, port_a)], Collaborators::default()).await;

    let a2 = a.clone();
    let b2 = b.clone();
    wait_for("peers to connect", move || {
        let a = a2.clone();
        let b = b2.clone();
        async move { a.peers.connected_count().await >= 1 && b.peers.connected_count().await >= 1 }
    })
    .await;
    (a, b)
}

#[tokio::test]
async fn announcement_round_trip_connects_both_sides() {
    let (a, b) = connected_pair().await;

    // Each side learned the other's identity and user agent.
    let peer_b = a.peers.get(&b.identity.peer_id()).await.expect("a knows b");
    let peer_a = b.peers.get(&a.identity.peer_id()).await.expect("b knows a");
    assert!(peer_b.user_agent().await.starts_with("filament/"));
    assert!(peer_a.user_agent().await.starts_with("filament/"));

    // The responder observed a direct connection, so the reported internal
    // port makes the peer connectable and shareable.
    wait_for("connectable records", move || {
        let peer_a = peer_a.clone();
        async move { peer_a.is_connectable(true, false).await }
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn bootstrap_stops_when_roots_connected() {
    let (a, port_a) = spawn_backend(Vec::new(), Collaborators::default()).await;
    let (c, port_c) = spawn_backend(Vec::new(), Collaborators::default()).await;
    let (b, _) = spawn_backend(
        vec![seed_for(&a, port_a), seed_for(&c, port_c)],
        Collaborators::default(),
    )
    .await;

    // Within two 7s cadence rounds both seeds must be connected root peers.
    let b2 = b.clone();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(14);
    loop {
        if b2.peers.connected_root_count().await >= 2 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("bootstrap did not reach 2 root peers within 14s");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn chat_reaches_connected_peers() {
    let (a, b) = connected_pair().await;

    let mut chat_rx = b.chat_events();
    let sent = a.send_chat_all("hello mesh").await;
    assert!(sent >= 1);

    let event = tokio::time::timeout(Duration::from_secs(5), chat_rx.recv())
        .await
        .expect("chat timeout")
        .expect("chat channel");
    assert_eq!(event.text, "hello mesh");
    assert_eq!(event.from, a.identity.peer_id());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn embedded_value_retrieval() {
    let (a, b) = connected_pair().await;

    // A publishes a 512-byte blob locally; B finds it via FIND_VALUE and
    // re-verifies the hash.
    let blob = vec![0xa5u8; 512];
    let hash = a.store_data_local(&blob);

    let found = b.get_data(&hash).await.expect("value found");
    assert_eq!(found.data, blob);
    assert_eq!(found.owner, a.identity.peer_id());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn file_transfer_round_trip() {
    let (a, b) = connected_pair().await;

    let blob: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let hash = a.store_data_local(&blob);

    let peer_a = b.peers.get(&a.identity.peer_id()).await.expect("b knows a");
    let conn = b
        .file_transfer_request(&peer_a, hash, 0, 0)
        .await
        .expect("transfer request");

    let (total, data) = Backend::receive_file(&conn).await.expect("receive");
    assert_eq!(total, blob.len() as u64);
    assert_eq!(data, blob);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn file_transfer_not_available() {
    let (a, b) = connected_pair().await;

    let peer_a = b.peers.get(&a.identity.peer_id()).await.expect("b knows a");
    let conn = b
        .file_transfer_request(&peer_a, [9u8; 32], 0, 0)
        .await
        .expect("transfer request");

    match Backend::receive_file(&conn).await {
        Err(filament::net::StreamError::Terminated(reason)) => {
            assert_eq!(reason, filament::net::STREAM_REASON_NOT_AVAILABLE);
        }
        other => panic!("expected 404 termination, got {other:?}"),
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn block_download_with_out_of_range_request() {
    // A's own chain has 4 blocks (numbers 0..4).
    let chain = MemoryUserBlockchain::new(
        7,
        (0..4u8).map(|i| vec![i; 64]).collect(),
    );
    let collab_a = Collaborators {
        user_blockchain: Arc::new(chain),
        ..Default::default()
    };

    let (a, port_a) = spawn_backend(Vec::new(), collab_a).await;
    let (b, _) = spawn_backend(vec![seed_for(&a, port_a)], Collaborators::default()).await;

    let a2 = a.clone();
    let b2 = b.clone();
    wait_for("peers to connect", move || {
        let a = a2.clone();
        let b = b2.clone();
        async move { a.peers.connected_count().await >= 1 && b.peers.connected_count().await >= 1 }
    })
    .await;

    let peer_a = b.peers.get(&a.identity.peer_id()).await.expect("b knows a");

    // In-range request streams the block bytes.
    let mut records = Vec::new();
    let count = b
        .block_download(
            &peer_a,
            a.identity.peer_id(),
            0,
            0,
            vec![BlockRange { offset: 1, limit: 2 }],
            |record| records.push(record),
        )
        .await
        .expect("download");
    assert_eq!(count, 2);
    assert_eq!(
        records[0],
        BlockStreamRecord::Block { number: 1, data: vec![1u8; 64] }
    );

    // Out-of-range request: exactly one NotAvailable record, then normal
    // completion.
    let mut records = Vec::new();
    let count = b
        .block_download(
            &peer_a,
            a.identity.peer_id(),
            0,
            0,
            vec![BlockRange { offset: 5, limit: 1 }],
            |record| records.push(record),
        )
        .await
        .expect("download");
    assert_eq!(count, 1);
    assert_eq!(records[0], BlockStreamRecord::NotAvailable { offset: 5 });

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn relay_assisted_traversal_connects_strangers() {
    // A and B both know relay R but not each other. A's direct announcement
    // goes to a dead endpoint; the traverse through R carries A's observed
    // address to B, and B answers with its own announcement.
    let (r, port_r) = spawn_backend(Vec::new(), Collaborators::default()).await;
    let (a, _) = spawn_backend(vec![seed_for(&r, port_r)], Collaborators::default()).await;
    let (b, _) = spawn_backend(vec![seed_for(&r, port_r)], Collaborators::default()).await;

    let r2 = r.clone();
    wait_for("both peers at the relay", move || {
        let r = r2.clone();
        async move { r.peers.connected_count().await >= 2 }
    })
    .await;

    // B must be shareable before R forwards anything to it; the relay only
    // forwards to targets it can reach.
    let dead_endpoint: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    let contacted = a
        .contact_arbitrary_peer(b.identity.public_key(), dead_endpoint, Some(r.identity.peer_id()))
        .await;
    assert!(contacted);

    let a2 = a.clone();
    let b_id = b.identity.peer_id();
    wait_for("traversal to open a connection", move || {
        let a = a2.clone();
        async move {
            match a.peers.get(&b_id).await {
                Some(peer) => peer.active_connection().await.is_some(),
                None => false,
            }
        }
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
    r.shutdown().await;
}

#[tokio::test]
async fn blacklisted_peer_cannot_connect() {
    let (a, port_a) = spawn_backend(Vec::new(), Collaborators::default()).await;
    let (b, _) = spawn_backend(vec![seed_for(&a, port_a)], Collaborators::default()).await;

    // A pre-bans B; B's announcements are dropped at admission.
    a.peers
        .blacklist_add(&b.identity.peer_id(), "test ban".into())
        .await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(a.peers.get(&b.identity.peer_id()).await.is_none());

    a.shutdown().await;
    b.shutdown().await;
}

//! Integration tests for Resin sync over libp2p.
//!
//! These tests create two peers with the in-memory libp2p transport, dial
//! one from the other and run send/receive through `RemoteTransport`.

use std::sync::Arc;
use std::time::Duration;

use libp2p::Transport as _;
use libp2p::core::transport::MemoryTransport as P2pMemoryTransport;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId, Swarm};
use resin_core::{
    CancellationToken, MemoryTransport, Node, NodeRef, ProgressTracker, ReceiveOptions,
    RemoteConfig, SendOptions, Value, receive, send,
};
use resin_libp2p::{Command, RemoteTransport, ResinBehaviour, run_swarm};
use tokio::sync::mpsc;

/// Create a new swarm with memory transport.
fn create_swarm(config: &RemoteConfig) -> Swarm<ResinBehaviour> {
    let keypair = Keypair::generate_ed25519();
    let peer_id = PeerId::from(keypair.public());

    let transport = P2pMemoryTransport::default()
        .upgrade(libp2p::core::upgrade::Version::V1)
        .authenticate(libp2p::noise::Config::new(&keypair).unwrap())
        .multiplex(libp2p::yamux::Config::default())
        .boxed();

    Swarm::new(
        transport,
        ResinBehaviour::new(config),
        peer_id,
        libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(Duration::from_secs(30)),
    )
}

/// A serving peer and a client peer connected to it.
struct Pair {
    server_store: Arc<MemoryTransport>,
    remote: RemoteTransport,
    /// Dropping this stops the server's swarm.
    _server_tx: mpsc::Sender<Command>,
}

async fn connected_pair(port: u64) -> Pair {
    let config = RemoteConfig {
        max_attempts: 5,
        initial_backoff_ms: 50,
        max_backoff_ms: 500,
        max_batch_records: 3,
        ..RemoteConfig::default()
    };
    let server_store = Arc::new(MemoryTransport::named("server"));
    let client_store = Arc::new(MemoryTransport::named("client"));

    let mut server = create_swarm(&config);
    let client = create_swarm(&config);
    let server_id = *server.local_peer_id();

    let address: Multiaddr = format!("/memory/{port}").parse().unwrap();
    server.listen_on(address.clone()).unwrap();

    let (server_tx, server_rx) = mpsc::channel(32);
    let (client_tx, client_rx) = mpsc::channel(32);
    tokio::spawn(run_swarm(
        server,
        server_store.clone(),
        server_rx,
        config.clone(),
    ));
    tokio::spawn(run_swarm(client, client_store, client_rx, config.clone()));

    client_tx.send(Command::Dial { address }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    Pair {
        server_store,
        remote: RemoteTransport::new(server_id, client_tx, config).with_name("server"),
        _server_tx: server_tx,
    }
}

fn model() -> NodeRef {
    Node::new("Model")
        .with("name", "tower")
        .with(
            "@floors",
            Value::List(
                (0..4)
                    .map(|level| Node::new("Floor").with("level", level).into())
                    .collect(),
            ),
        )
        .with("@(10)heights", Value::List((0..35).map(Value::from).collect()))
        .into_ref()
}

#[tokio::test]
async fn send_and_receive_over_memory_transport() {
    let Pair {
        server_store,
        remote,
        _server_tx,
    } = connected_pair(47_001).await;
    let root = model();

    let report = send(
        &root,
        &[&remote],
        &SendOptions::default(),
        &ProgressTracker::new(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    // root, 4 floors, 4 height chunks
    assert_eq!(report.record_count, 9);
    assert_eq!(server_store.len(), 9);

    let local = MemoryTransport::named("local");
    let received = receive(
        &report.root_id,
        &remote,
        &local,
        &ReceiveOptions::default(),
        &ProgressTracker::new(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(received, root);
    assert_eq!(local.len(), 9);
}

#[tokio::test]
async fn resend_over_network_uploads_nothing() {
    let Pair {
        server_store,
        remote,
        _server_tx,
    } = connected_pair(47_002).await;
    let root = model();

    for _ in 0..2 {
        send(
            &root,
            &[&remote],
            &SendOptions::default(),
            &ProgressTracker::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    }
    assert_eq!(server_store.save_calls(), 9);
}

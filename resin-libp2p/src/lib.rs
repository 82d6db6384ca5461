//! libp2p transport for Resin object sync.
//!
//! This crate exposes a remote peer as a Resin [`Transport`] and serves a
//! local transport to peers.
//!
//! # Architecture
//!
//! - `RemoteTransport` implements `Transport` for a remote peer, with batching and retries
//! - `ResinCodec` handles length-prefixed CBOR over libp2p streams
//! - `handle_request` processes incoming requests against a local transport
//! - `run_swarm` drives the swarm: outbound requests, dials and inbound requests
//!
//! # Example
//!
//! ```ignore
//! use resin_libp2p::{RemoteTransport, run_swarm};
//! use resin_core::{receive, RemoteConfig};
//!
//! let config = RemoteConfig::default();
//! let (command_tx, command_rx) = tokio::sync::mpsc::channel(32);
//! tokio::spawn(run_swarm(swarm, local_store.clone(), command_rx, config.clone()));
//!
//! let remote = RemoteTransport::new(peer_id, command_tx, config);
//! let root = receive(&root_id, &remote, &local_cache, &options, &progress, &cancel).await?;
//! ```

mod codec;
mod handler;
mod protocol;
mod remote;

pub use codec::{ResinCodec, message_limit, protocol};
pub use handler::handle_request;
pub use protocol::{PROTOCOL_NAME, Request, Response, StoredRecord};
pub use remote::{Command, RemoteError, RemoteTransport, RetryPolicy};

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use libp2p::Swarm;
use libp2p::request_response::{self, OutboundRequestId};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use resin_core::{RemoteConfig, Transport};
use tokio::sync::{mpsc, oneshot};

/// Behaviour combining request_response for the object protocol.
#[derive(NetworkBehaviour)]
pub struct ResinBehaviour {
    pub sync: request_response::Behaviour<ResinCodec>,
}

impl ResinBehaviour {
    /// Create a new behaviour with frame limits sized for `config`.
    pub fn new(config: &RemoteConfig) -> Self {
        let sync = request_response::Behaviour::with_codec(
            ResinCodec::new(config),
            [(protocol(), request_response::ProtocolSupport::Full)],
            request_response::Config::default(),
        );
        Self { sync }
    }
}

impl Default for ResinBehaviour {
    fn default() -> Self {
        Self::new(&RemoteConfig::default())
    }
}

type PendingRequests = HashMap<OutboundRequestId, oneshot::Sender<Result<Response, RemoteError>>>;

/// Drive the swarm, processing commands and events.
///
/// This function runs the swarm event loop, handling:
/// - Outbound requests and dials via the command channel
/// - Inbound requests by calling the handler with the local store
/// - Response matching for pending requests
///
/// Answers to `Get` requests carry at most `config.max_batch_bytes` of
/// record content. Returns when the command channel is closed.
pub async fn run_swarm(
    mut swarm: Swarm<ResinBehaviour>,
    local_store: Arc<dyn Transport>,
    mut command_rx: mpsc::Receiver<Command>,
    config: RemoteConfig,
) {
    let mut pending_requests: PendingRequests = HashMap::new();
    let response_limit = config.max_batch_bytes;

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else {
                    tracing::debug!("command channel closed, stopping swarm");
                    return;
                };
                match command {
                    Command::SendRequest { peer, request, response_tx } => {
                        let request_id = swarm.behaviour_mut().sync.send_request(&peer, request);
                        pending_requests.insert(request_id, response_tx);
                    }
                    Command::Dial { address } => {
                        if let Err(e) = swarm.dial(address.clone()) {
                            tracing::warn!(%address, error = %e, "dial failed");
                        }
                    }
                }
            }

            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::Behaviour(ResinBehaviourEvent::Sync(event)) => {
                        handle_event(
                            &mut swarm,
                            local_store.as_ref(),
                            &mut pending_requests,
                            response_limit,
                            event,
                        )
                        .await;
                    }
                    SwarmEvent::NewListenAddr { address, .. } => {
                        tracing::info!(%address, "listening");
                    }
                    SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                        tracing::debug!(%peer_id, "connection established");
                    }
                    SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                        tracing::warn!(?peer_id, %error, "outgoing connection failed");
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_event(
    swarm: &mut Swarm<ResinBehaviour>,
    local_store: &dyn Transport,
    pending_requests: &mut PendingRequests,
    response_limit: usize,
    event: request_response::Event<Request, Response>,
) {
    match event {
        request_response::Event::Message { peer, message, .. } => match message {
            request_response::Message::Request { request, channel, .. } => {
                tracing::debug!(%peer, kind = request.kind(), "inbound request");
                let response = handle_request(local_store, request, response_limit).await;
                if swarm.behaviour_mut().sync.send_response(channel, response).is_err() {
                    tracing::warn!(%peer, "peer went away before response");
                }
            }
            request_response::Message::Response { request_id, response } => {
                if let Some(tx) = pending_requests.remove(&request_id) {
                    let _ = tx.send(Ok(response));
                }
            }
        },
        request_response::Event::OutboundFailure { request_id, error, peer, .. } => {
            tracing::debug!(%peer, %error, "outbound request failed");
            if let Some(tx) = pending_requests.remove(&request_id) {
                let _ = tx.send(Err(RemoteError::RequestFailed(error.to_string())));
            }
        }
        request_response::Event::InboundFailure { peer, error, .. } => {
            tracing::warn!(%peer, %error, "inbound request failed");
        }
        request_response::Event::ResponseSent { .. } => {}
    }
}

//! RemoteTransport - wraps a libp2p peer as a Transport.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use resin_core::{Id, RemoteConfig, Transport, TransportError};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{Request, Response, StoredRecord};

/// Error from a single remote request.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("unexpected response type")]
    UnexpectedResponse,
    #[error("remote error: {message}")]
    Remote { message: String, transient: bool },
}

impl RemoteError {
    /// Returns true if the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::RequestFailed(_) => true,
            RemoteError::Remote { transient, .. } => *transient,
            RemoteError::ConnectionClosed | RemoteError::UnexpectedResponse => false,
        }
    }
}

/// Command sent to the swarm driver.
pub enum Command {
    /// Send a request to a peer.
    SendRequest {
        peer: PeerId,
        request: Request,
        response_tx: oneshot::Sender<Result<Response, RemoteError>>,
    },
    /// Dial a peer address.
    Dial { address: Multiaddr },
}

/// Bounded exponential backoff for transient request failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before retrying after the given attempt (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&RemoteConfig> for RetryPolicy {
    fn from(config: &RemoteConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// A remote peer exposed as a Transport.
///
/// Sends requests via the command channel and waits for responses. Every
/// request is retried on transient failure; all of them are idempotent.
pub struct RemoteTransport {
    name: String,
    peer_id: PeerId,
    command_tx: mpsc::Sender<Command>,
    config: RemoteConfig,
    retry: RetryPolicy,
}

impl RemoteTransport {
    pub fn new(peer_id: PeerId, command_tx: mpsc::Sender<Command>, config: RemoteConfig) -> Self {
        Self {
            name: format!("remote:{peer_id}"),
            retry: RetryPolicy::from(&config),
            peer_id,
            command_tx,
            config,
        }
    }

    /// Overrides the name used in progress and errors.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the peer ID this transport talks to.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn send_request(&self, request: Request) -> Result<Response, RemoteError> {
        let (tx, rx) = oneshot::channel();

        self.command_tx
            .send(Command::SendRequest {
                peer: self.peer_id,
                request,
                response_tx: tx,
            })
            .await
            .map_err(|_| RemoteError::ConnectionClosed)?;

        match rx.await.map_err(|_| RemoteError::ConnectionClosed)?? {
            Response::Error { message, transient } => {
                Err(RemoteError::Remote { message, transient })
            }
            response => Ok(response),
        }
    }

    /// Sends a request, retrying transient failures with backoff.
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        let first_id = request.first_id();
        let mut attempt = 0;
        loop {
            let error = match self.send_request(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            attempt += 1;
            if !error.is_transient() {
                return Err(self.transport_error(error, first_id));
            }
            if attempt >= self.retry.max_attempts {
                tracing::warn!(
                    transport = %self.name,
                    kind = request.kind(),
                    attempts = attempt,
                    error = %error,
                    "giving up on request"
                );
                return Err(TransportError::Rejected {
                    transport: self.name.clone(),
                    id: first_id,
                    message: format!(
                        "{} failed after {attempt} attempts{}: {error}",
                        request.kind(),
                        first_id.map(|id| format!(" at {id}")).unwrap_or_default()
                    ),
                });
            }
            let backoff = self.retry.backoff_for_attempt(attempt - 1);
            tracing::warn!(
                transport = %self.name,
                kind = request.kind(),
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "retrying request"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    fn transport_error(&self, error: RemoteError, id: Option<Id>) -> TransportError {
        let transport = self.name.clone();
        match error {
            RemoteError::ConnectionClosed => TransportError::Closed { transport },
            RemoteError::RequestFailed(message) => TransportError::Transient { transport, message },
            RemoteError::UnexpectedResponse => TransportError::Backend {
                transport,
                message: "unexpected response type".to_string(),
            },
            RemoteError::Remote { message, .. } => TransportError::Rejected {
                transport,
                id,
                message,
            },
        }
    }

    fn unexpected(&self) -> TransportError {
        self.transport_error(RemoteError::UnexpectedResponse, None)
    }

    async fn put(&self, records: Vec<(Id, Vec<u8>)>) -> Result<(), TransportError> {
        let count = records.len();
        let records = records.into_iter().map(StoredRecord::from).collect();
        match self.request(Request::Put { records }).await? {
            Response::Stored { .. } => {
                tracing::debug!(transport = %self.name, records = count, "uploaded batch");
                Ok(())
            }
            _ => Err(self.unexpected()),
        }
    }
}

/// Splits records into batches bounded by count and total content size.
///
/// Callers reject records larger than `max_bytes` beforehand.
pub(crate) fn split_batches(
    records: Vec<(Id, Vec<u8>)>,
    max_records: usize,
    max_bytes: usize,
) -> Vec<Vec<(Id, Vec<u8>)>> {
    let max_records = max_records.max(1);
    let mut batches = Vec::new();
    let mut batch: Vec<(Id, Vec<u8>)> = Vec::new();
    let mut bytes = 0;
    for (id, content) in records {
        let full = batch.len() >= max_records || bytes + content.len() > max_bytes;
        if full && !batch.is_empty() {
            batches.push(std::mem::take(&mut batch));
            bytes = 0;
        }
        bytes += content.len();
        batch.push((id, content));
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

#[async_trait]
impl Transport for RemoteTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, id: Id, content: Vec<u8>) -> Result<(), TransportError> {
        self.put(vec![(id, content)]).await
    }

    async fn save_many(&self, records: Vec<(Id, Vec<u8>)>) -> Result<(), TransportError> {
        let max_bytes = self.config.max_batch_bytes;
        let oversized = records
            .iter()
            .find(|(_, content)| content.len() > max_bytes);
        if let Some((id, content)) = oversized {
            return Err(TransportError::Rejected {
                transport: self.name.clone(),
                id: Some(*id),
                message: format!(
                    "record of {} bytes exceeds the batch limit of {max_bytes} bytes",
                    content.len()
                ),
            });
        }
        for batch in split_batches(
            records,
            self.config.max_batch_records,
            self.config.max_batch_bytes,
        ) {
            self.put(batch).await?;
        }
        Ok(())
    }

    async fn exists(&self, ids: &[Id]) -> Result<HashSet<Id>, TransportError> {
        let mut present = HashSet::new();
        for batch in ids.chunks(self.config.has_batch_size.max(1)) {
            let response = self
                .request(Request::Has {
                    ids: batch.to_vec(),
                })
                .await?;
            let Response::Has { present: flags } = response else {
                return Err(self.unexpected());
            };
            if flags.len() != batch.len() {
                return Err(self.unexpected());
            }
            present.extend(
                batch
                    .iter()
                    .zip(flags)
                    .filter(|(_, present)| *present)
                    .map(|(id, _)| *id),
            );
        }
        Ok(present)
    }

    async fn load(&self, id: &Id) -> Result<Vec<u8>, TransportError> {
        self.load_many(std::slice::from_ref(id))
            .await?
            .into_iter()
            .find(|(found, _)| found == id)
            .map(|(_, content)| content)
            .ok_or_else(|| TransportError::NotFound {
                transport: self.name.clone(),
                id: *id,
            })
    }

    async fn load_many(&self, ids: &[Id]) -> Result<Vec<(Id, Vec<u8>)>, TransportError> {
        let mut records = Vec::with_capacity(ids.len());
        for batch in ids.chunks(self.config.get_batch_size.max(1)) {
            let mut pending = batch.to_vec();
            // the peer may leave ids out to bound its response; ask again
            while !pending.is_empty() {
                let response = self
                    .request(Request::Get {
                        ids: pending.clone(),
                    })
                    .await?;
                let Response::Records { found, missing } = response else {
                    return Err(self.unexpected());
                };
                let answered: HashSet<Id> = found
                    .iter()
                    .map(|record| record.id)
                    .chain(missing)
                    .collect();
                if !pending.iter().any(|id| answered.contains(id)) {
                    return Err(self.unexpected());
                }
                pending.retain(|id| !answered.contains(id));
                records.extend(found.into_iter().map(<(Id, Vec<u8>)>::from));
            }
        }
        Ok(records)
    }

    async fn flush(&self) -> Result<(), TransportError> {
        // Put responses are sent after the serving peer flushed.
        Ok(())
    }
}

//! Send and receive between transports.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use futures::future::join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use crate::codec::{CodecError, decode_closure_of};
use crate::config::SyncConfig;
use crate::decompose::{DecomposeError, DecomposeWarning, Decomposer, Decomposition};
use crate::hash::HashPolicy;
use crate::id::Id;
use crate::node::NodeRef;
use crate::progress::ProgressTracker;
use crate::reconstruct::{ReconstructError, Reconstructor};
use crate::transport::{Transport, TransportError};

/// Options for [`send`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub hash_policy: HashPolicy,
    pub chunk_size: usize,
    /// Records per `save_many` call.
    pub upload_batch_size: usize,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions::from_config(&SyncConfig::default())
    }
}

impl SendOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        SendOptions {
            hash_policy: HashPolicy::default(),
            chunk_size: config.decompose.chunk_size,
            upload_batch_size: config.send.upload_batch_size,
        }
    }
}

/// Options for [`receive`].
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Ids per `load_many` request to the remote.
    pub fetch_batch_size: usize,
    /// Fetch requests in flight at once.
    pub fetch_concurrency: usize,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        ReceiveOptions::from_config(&SyncConfig::default())
    }
}

impl ReceiveOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        ReceiveOptions {
            fetch_batch_size: config.receive.fetch_batch_size,
            fetch_concurrency: config.receive.fetch_concurrency,
        }
    }
}

/// What happened on one target transport.
#[derive(Debug, Clone)]
pub enum TransportOutcome {
    Completed {
        /// Records newly uploaded.
        uploaded: usize,
        /// Records the transport already held.
        skipped: usize,
    },
    Cancelled,
    Failed(TransportError),
}

impl TransportOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TransportOutcome::Completed { .. })
    }
}

/// Result of a send.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub root_id: Id,
    pub record_count: usize,
    /// Outcome per transport name, in the order transports were given.
    pub outcomes: Vec<(String, TransportOutcome)>,
    pub warnings: Vec<DecomposeWarning>,
}

impl SendReport {
    /// True if every transport completed.
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_completed())
    }

    pub fn outcome(&self, transport: &str) -> Option<&TransportOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == transport)
            .map(|(_, outcome)| outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &TransportError)> {
        self.outcomes.iter().filter_map(|(name, outcome)| match outcome {
            TransportOutcome::Failed(e) => Some((name.as_str(), e)),
            _ => None,
        })
    }
}

impl fmt::Display for SendReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} records from {}", self.record_count, self.root_id)?;
        for (name, outcome) in &self.outcomes {
            match outcome {
                TransportOutcome::Completed { uploaded, skipped } => {
                    write!(f, "; {name}: {uploaded} uploaded, {skipped} present")?
                }
                TransportOutcome::Cancelled => write!(f, "; {name}: cancelled")?,
                TransportOutcome::Failed(e) => write!(f, "; {name}: {e}")?,
            }
        }
        Ok(())
    }
}

/// Error type for [`send`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send cancelled")]
    Cancelled,
    #[error("no target transports")]
    NoTransports,
    #[error("send failed on some transports: {0}")]
    Transports(SendReport),
    #[error("decomposition worker failed: {0}")]
    Worker(String),
}

impl SendError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SendError::Cancelled)
    }
}

/// Error type for [`receive`] and [`copy_with_children`].
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("receive cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("object {id} has an unreadable closure: {source}")]
    Malformed {
        id: Id,
        #[source]
        source: CodecError,
    },
    #[error("object {0} missing from the remote")]
    NotFound(Id),
    #[error(transparent)]
    Reconstruct(ReconstructError),
}

impl ReceiveError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ReceiveError::Cancelled | ReceiveError::Reconstruct(ReconstructError::Cancelled)
        )
    }
}

impl From<ReconstructError> for ReceiveError {
    fn from(e: ReconstructError) -> Self {
        match e {
            ReconstructError::Cancelled => ReceiveError::Cancelled,
            ReconstructError::NotFound(id) => ReceiveError::NotFound(id),
            other => ReceiveError::Reconstruct(other),
        }
    }
}

/// Decomposes `root` and uploads the records to every transport.
///
/// Transports are served concurrently. Records a transport already holds are
/// not uploaded again. Progress is counted per transport name.
#[tracing::instrument(skip_all, fields(transports = transports.len()))]
pub async fn send(
    root: &NodeRef,
    transports: &[&dyn Transport],
    options: &SendOptions,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> Result<SendReport, SendError> {
    if transports.is_empty() {
        return Err(SendError::NoTransports);
    }

    let decomposer =
        Decomposer::new(options.hash_policy.clone()).with_chunk_size(options.chunk_size);
    let worker_root = root.clone();
    let worker_cancel = cancel.clone();
    let decomposition = tokio::task::spawn_blocking(move || {
        decomposer.decompose_cancellable(&worker_root, &worker_cancel)
    })
    .await
    .map_err(|e| SendError::Worker(e.to_string()))?
    .map_err(|e| match e {
        DecomposeError::Cancelled => SendError::Cancelled,
    })?;

    if cancel.is_cancelled() {
        return Err(SendError::Cancelled);
    }
    tracing::info!(
        root = %decomposition.root_id,
        records = decomposition.len(),
        "sending"
    );
    progress.set_total(decomposition.len() as u64);

    let batch_size = options.upload_batch_size.max(1);
    let outcomes = join_all(transports.iter().map(|transport| {
        send_to(*transport, &decomposition, batch_size, progress, cancel)
    }))
    .await;

    if outcomes
        .iter()
        .any(|outcome| matches!(outcome, TransportOutcome::Cancelled))
    {
        return Err(SendError::Cancelled);
    }

    let report = SendReport {
        root_id: decomposition.root_id,
        record_count: decomposition.len(),
        outcomes: transports
            .iter()
            .map(|t| t.name().to_string())
            .zip(outcomes)
            .collect(),
        warnings: decomposition.warnings,
    };
    if report.is_complete() {
        tracing::info!(%report, "send complete");
        Ok(report)
    } else {
        Err(SendError::Transports(report))
    }
}

async fn send_to(
    transport: &dyn Transport,
    decomposition: &Decomposition,
    batch_size: usize,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> TransportOutcome {
    match upload(transport, decomposition, batch_size, progress, cancel).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => TransportOutcome::Cancelled,
        Err(e) => {
            tracing::warn!(transport = transport.name(), error = %e, "send failed");
            TransportOutcome::Failed(e)
        }
    }
}

/// Returns `None` if cancelled before finishing.
async fn upload(
    transport: &dyn Transport,
    decomposition: &Decomposition,
    batch_size: usize,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> Result<Option<TransportOutcome>, TransportError> {
    let name = transport.name();
    let present = transport.exists(&decomposition.ids()).await?;
    progress.advance(name, present.len() as u64);

    let missing: Vec<(Id, &Vec<u8>)> = decomposition
        .records
        .iter()
        .filter(|(id, _)| !present.contains(id))
        .map(|(id, bytes)| (*id, bytes))
        .collect();
    tracing::debug!(
        transport = name,
        present = present.len(),
        missing = missing.len(),
        "computed missing records"
    );

    for batch in missing.chunks(batch_size) {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let records = batch
            .iter()
            .map(|(id, bytes)| (*id, (*bytes).clone()))
            .collect();
        transport.save_many(records).await?;
        progress.advance(name, batch.len() as u64);
        tracing::debug!(transport = name, records = batch.len(), "uploaded batch");
    }

    transport.flush().await?;
    if cancel.is_cancelled() {
        tracing::debug!(transport = name, "cancelled after flush, records are complete");
    }
    Ok(Some(TransportOutcome::Completed {
        uploaded: missing.len(),
        skipped: present.len(),
    }))
}

/// Copies `id` and every record in its closure from `source` into `dest`.
///
/// Records `dest` already holds are skipped. The root is saved last and
/// `dest` is flushed before returning. Returns the number of records copied.
#[tracing::instrument(skip_all, fields(id = %id, source = source.name(), dest = dest.name()))]
pub async fn copy_with_children(
    source: &dyn Transport,
    dest: &dyn Transport,
    id: &Id,
    options: &ReceiveOptions,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> Result<usize, ReceiveError> {
    let root = source.load(id).await.map_err(|e| match e {
        TransportError::NotFound { id, .. } => ReceiveError::NotFound(id),
        other => ReceiveError::Transport(other),
    })?;
    let closure = decode_closure_of(&root)
        .map_err(|source| ReceiveError::Malformed { id: *id, source })?;
    progress.set_total(closure.len() as u64 + 1);

    let children = ordered_by_depth(&closure);
    let present = if children.is_empty() {
        HashSet::new()
    } else {
        dest.exists(&children).await?
    };
    progress.advance(dest.name(), present.len() as u64);
    let missing: Vec<Id> = children
        .into_iter()
        .filter(|child| !present.contains(child))
        .collect();
    tracing::debug!(
        closure = closure.len(),
        missing = missing.len(),
        "copying closure"
    );

    let batch_size = options.fetch_batch_size.max(1);
    let concurrency = options.fetch_concurrency.max(1);
    let batches: Vec<Vec<Id>> = missing.chunks(batch_size).map(<[Id]>::to_vec).collect();
    let copied: Vec<usize> = stream::iter(batches)
        .map(|batch| fetch_batch(source, dest, batch, progress, cancel))
        .buffer_unordered(concurrency)
        .try_collect()
        .await?;

    if cancel.is_cancelled() {
        return Err(ReceiveError::Cancelled);
    }
    dest.save(*id, root).await?;
    dest.flush().await?;
    progress.advance(dest.name(), 1);
    Ok(copied.into_iter().sum::<usize>() + 1)
}

async fn fetch_batch(
    source: &dyn Transport,
    dest: &dyn Transport,
    batch: Vec<Id>,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> Result<usize, ReceiveError> {
    if cancel.is_cancelled() {
        return Err(ReceiveError::Cancelled);
    }
    let records = source.load_many(&batch).await?;
    if records.len() < batch.len() {
        let found: HashSet<Id> = records.iter().map(|(id, _)| *id).collect();
        if let Some(id) = batch.iter().find(|id| !found.contains(id)) {
            return Err(ReceiveError::NotFound(*id));
        }
    }
    let count = records.len();
    dest.save_many(records).await?;
    progress.advance(dest.name(), count as u64);
    Ok(count)
}

/// Closure ids with the shallowest first.
fn ordered_by_depth(closure: &BTreeMap<Id, u32>) -> Vec<Id> {
    let mut ids: Vec<(u32, Id)> = closure.iter().map(|(id, depth)| (*depth, *id)).collect();
    ids.sort();
    ids.into_iter().map(|(_, id)| id).collect()
}

/// Fetches `root_id` into `local` if needed and reconstructs it.
///
/// A root already present in `local` is taken as proof that its closure is
/// local too. Otherwise the root and its closure are copied from `remote`
/// first. Reconstruction then reads through `[local, remote]`.
#[tracing::instrument(skip_all, fields(root = %root_id, remote = remote.name(), local = local.name()))]
pub async fn receive(
    root_id: &Id,
    remote: &dyn Transport,
    local: &dyn Transport,
    options: &ReceiveOptions,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> Result<NodeRef, ReceiveError> {
    if cancel.is_cancelled() {
        return Err(ReceiveError::Cancelled);
    }
    let cached = local.exists(std::slice::from_ref(root_id)).await?;
    if cached.contains(root_id) {
        tracing::debug!("root found in local transport");
    } else {
        let copied = copy_with_children(remote, local, root_id, options, progress, cancel).await?;
        tracing::info!(copied, "fetched from remote");
    }

    let root = Reconstructor::new(vec![local, remote])
        .with_progress(progress)
        .with_cancellation(cancel)
        .reconstruct(root_id)
        .await?;
    tracing::info!("receive complete");
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::node::Node;

    fn sample() -> NodeRef {
        Node::base()
            .with("a", 1)
            .with_detached("b", Node::base().with("c", 2))
            .into_ref()
    }

    #[tokio::test]
    async fn send_uploads_to_every_transport() {
        let first = MemoryTransport::named("first");
        let second = MemoryTransport::named("second");
        let progress = ProgressTracker::new();

        let report = send(
            &sample(),
            &[&first, &second],
            &SendOptions::default(),
            &progress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.record_count, 2);
        assert!(report.is_complete());
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(progress.get("first"), 2);
        assert_eq!(progress.snapshot().total, Some(2));
    }

    #[tokio::test]
    async fn second_send_uploads_nothing() {
        let target = MemoryTransport::new();
        let root = sample();
        for _ in 0..2 {
            send(
                &root,
                &[&target],
                &SendOptions::default(),
                &ProgressTracker::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        }
        assert_eq!(target.save_calls(), 2);
    }

    #[tokio::test]
    async fn send_without_transports_fails() {
        let err = send(
            &sample(),
            &[],
            &SendOptions::default(),
            &ProgressTracker::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SendError::NoTransports));
    }

    #[tokio::test]
    async fn cancelled_send_reports_cancellation() {
        let target = MemoryTransport::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = send(
            &sample(),
            &[&target],
            &SendOptions::default(),
            &ProgressTracker::new(),
            &token,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
        assert!(target.is_empty());
    }

    /// Cancels the token once its records are flushed.
    struct CancelOnFlush {
        inner: MemoryTransport,
        token: CancellationToken,
    }

    #[async_trait::async_trait]
    impl Transport for CancelOnFlush {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn save(&self, id: Id, content: Vec<u8>) -> Result<(), TransportError> {
            self.inner.save(id, content).await
        }

        async fn exists(&self, ids: &[Id]) -> Result<HashSet<Id>, TransportError> {
            self.inner.exists(ids).await
        }

        async fn load(&self, id: &Id) -> Result<Vec<u8>, TransportError> {
            self.inner.load(id).await
        }

        async fn flush(&self) -> Result<(), TransportError> {
            self.inner.flush().await?;
            self.token.cancel();
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancellation_after_flush_keeps_the_report() {
        let token = CancellationToken::new();
        let target = CancelOnFlush {
            inner: MemoryTransport::named("target"),
            token: token.clone(),
        };

        let report = send(
            &sample(),
            &[&target],
            &SendOptions::default(),
            &ProgressTracker::new(),
            &token,
        )
        .await
        .unwrap();

        assert!(token.is_cancelled());
        assert!(report.is_complete());
        assert_eq!(target.inner.len(), 2);
    }

    #[tokio::test]
    async fn receive_copies_into_local() {
        let remote = MemoryTransport::named("remote");
        let local = MemoryTransport::named("local");
        let root = sample();
        let report = send(
            &root,
            &[&remote],
            &SendOptions::default(),
            &ProgressTracker::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

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
        assert_eq!(local.ids(), remote.ids());
    }

    #[tokio::test]
    async fn receive_uses_local_hit() {
        let remote = MemoryTransport::named("remote");
        let local = MemoryTransport::named("local");
        let root = sample();
        let report = send(
            &root,
            &[&local],
            &SendOptions::default(),
            &ProgressTracker::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        receive(
            &report.root_id,
            &remote,
            &local,
            &ReceiveOptions::default(),
            &ProgressTracker::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(remote.load_calls(), 0);
    }

    #[tokio::test]
    async fn receive_unknown_root_is_not_found() {
        let remote = MemoryTransport::named("remote");
        let local = MemoryTransport::named("local");
        let id = Id::from_bytes([5; 32]);
        let err = receive(
            &id,
            &remote,
            &local,
            &ReceiveOptions::default(),
            &ProgressTracker::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReceiveError::NotFound(missing) if missing == id));
    }

    #[test]
    fn closure_is_ordered_shallow_first() {
        let a = Id::from_bytes([1; 32]);
        let b = Id::from_bytes([2; 32]);
        let c = Id::from_bytes([3; 32]);
        let closure = BTreeMap::from([(a, 3), (b, 1), (c, 2)]);
        assert_eq!(ordered_by_depth(&closure), vec![b, c, a]);
    }
}

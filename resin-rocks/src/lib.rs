//! RocksDB-backed local cache transport for Resin.
//!
//! Saves are queued to a single writer thread that commits them in
//! `WriteBatch` transactions. Until a record is committed it is served from
//! an in-memory pending map, so reads observe every accepted save.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;

use async_trait::async_trait;
use resin_core::{Id, LocalCacheConfig, Transport, TransportError};
use rocksdb::{DB, Options, WriteBatch};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Transport name used in progress and errors.
pub const LOCAL_CACHE_NAME: &str = "local";

#[derive(Debug, Error)]
pub enum LocalCacheError {
    #[error("RocksDB error: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-user cache location under the platform data directory.
pub fn default_cache_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("resin")
        .join("cache")
}

enum Command {
    Write(Id, Vec<u8>),
    Flush(oneshot::Sender<Result<(), String>>),
}

type Pending = Arc<RwLock<HashMap<Id, Vec<u8>>>>;

/// A durable transport backed by RocksDB with a single writer.
pub struct LocalCacheTransport {
    db: Arc<DB>,
    pending: Pending,
    sender: Option<mpsc::Sender<Command>>,
    writer: Option<JoinHandle<()>>,
}

impl LocalCacheTransport {
    /// Opens the cache at the given path.
    ///
    /// Creates the database if it doesn't exist.
    pub fn open(path: impl AsRef<Path>, config: &LocalCacheConfig) -> Result<Self, LocalCacheError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = Arc::new(DB::open(&opts, path)?);
        let pending: Pending = Arc::new(RwLock::new(HashMap::new()));

        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let writer = Writer {
            db: db.clone(),
            pending: pending.clone(),
            max_transaction_size: config.max_transaction_size.max(1),
            batch: Vec::new(),
            failure: None,
        };
        let writer = std::thread::Builder::new()
            .name("resin-local-cache".to_string())
            .spawn(move || writer.run(receiver))?;
        tracing::debug!(path = %path.display(), "opened local cache");

        Ok(Self {
            db,
            pending,
            sender: Some(sender),
            writer: Some(writer),
        })
    }

    /// Opens the configured path, or the per-user cache if none is set.
    pub fn open_default(config: &LocalCacheConfig) -> Result<Self, LocalCacheError> {
        let path = config.path.clone().unwrap_or_else(default_cache_path);
        Self::open(path, config)
    }

    /// Number of accepted saves not yet committed.
    pub fn pending_len(&self) -> usize {
        self.pending
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn pending_get(&self, id: &Id) -> Option<Vec<u8>> {
        self.pending
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    async fn send(&self, command: Command) -> Result<(), TransportError> {
        let closed = || TransportError::Closed {
            transport: LOCAL_CACHE_NAME.to_string(),
        };
        let sender = self.sender.as_ref().ok_or_else(closed)?;
        sender.send(command).await.map_err(|_| closed())
    }

    fn backend(e: rocksdb::Error) -> TransportError {
        TransportError::Backend {
            transport: LOCAL_CACHE_NAME.to_string(),
            message: e.to_string(),
        }
    }
}

impl Drop for LocalCacheTransport {
    fn drop(&mut self) {
        // Closing the queue lets the writer commit what is left and exit.
        self.sender.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                tracing::warn!("local cache writer panicked");
            }
        }
    }
}

#[async_trait]
impl Transport for LocalCacheTransport {
    fn name(&self) -> &str {
        LOCAL_CACHE_NAME
    }

    async fn save(&self, id: Id, content: Vec<u8>) -> Result<(), TransportError> {
        self.pending
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, content.clone());
        self.send(Command::Write(id, content)).await
    }

    async fn save_many(&self, records: Vec<(Id, Vec<u8>)>) -> Result<(), TransportError> {
        {
            let mut pending = self.pending.write().unwrap_or_else(PoisonError::into_inner);
            for (id, content) in &records {
                pending.insert(*id, content.clone());
            }
        }
        for (id, content) in records {
            self.send(Command::Write(id, content)).await?;
        }
        Ok(())
    }

    async fn exists(&self, ids: &[Id]) -> Result<HashSet<Id>, TransportError> {
        let mut present = HashSet::new();
        let mut unresolved = Vec::new();
        {
            let pending = self.pending.read().unwrap_or_else(PoisonError::into_inner);
            for id in ids {
                if pending.contains_key(id) {
                    present.insert(*id);
                } else {
                    unresolved.push(*id);
                }
            }
        }
        for id in unresolved {
            if self
                .db
                .get_pinned(id.as_bytes())
                .map_err(Self::backend)?
                .is_some()
            {
                present.insert(id);
            }
        }
        Ok(present)
    }

    async fn load(&self, id: &Id) -> Result<Vec<u8>, TransportError> {
        if let Some(content) = self.pending_get(id) {
            return Ok(content);
        }
        self.db
            .get(id.as_bytes())
            .map_err(Self::backend)?
            .ok_or_else(|| TransportError::NotFound {
                transport: LOCAL_CACHE_NAME.to_string(),
                id: *id,
            })
    }

    async fn flush(&self) -> Result<(), TransportError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Flush(reply)).await?;
        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(TransportError::Backend {
                transport: LOCAL_CACHE_NAME.to_string(),
                message,
            }),
            Err(_) => Err(TransportError::Closed {
                transport: LOCAL_CACHE_NAME.to_string(),
            }),
        }
    }
}

/// The single consumer of the write queue.
struct Writer {
    db: Arc<DB>,
    pending: Pending,
    max_transaction_size: usize,
    batch: Vec<(Id, Vec<u8>)>,
    /// First commit failure since the last flush.
    failure: Option<String>,
}

impl Writer {
    fn run(mut self, mut receiver: mpsc::Receiver<Command>) {
        while let Some(command) = receiver.blocking_recv() {
            let mut next = Some(command);
            while let Some(command) = next.take() {
                self.handle(command);
                next = receiver.try_recv().ok();
            }
            // Queue drained: commit the partial batch.
            self.commit();
        }
        self.commit();
        tracing::debug!("local cache writer stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Write(id, content) => {
                self.batch.push((id, content));
                if self.batch.len() >= self.max_transaction_size {
                    self.commit();
                }
            }
            Command::Flush(reply) => {
                self.commit();
                let result = match self.failure.take() {
                    Some(message) => Err(message),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn commit(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.batch);
        let mut batch = WriteBatch::default();
        for (id, content) in &records {
            batch.put(id.as_bytes(), content);
        }
        match self.db.write(batch) {
            Ok(()) => tracing::debug!(records = records.len(), "committed write batch"),
            Err(e) => {
                tracing::warn!(error = %e, records = records.len(), "write batch failed");
                self.failure.get_or_insert_with(|| e.to_string());
            }
        }
        let mut pending = self.pending.write().unwrap_or_else(PoisonError::into_inner);
        for (id, _) in &records {
            pending.remove(id);
        }
    }
}

use std::collections::HashSet;

use async_trait::async_trait;

use crate::id::Id;

/// Error returned by a transport operation.
///
/// Every variant names the transport it came from so that multi-transport
/// sends can report failures per target.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("{transport}: object {id} not found")]
    NotFound { transport: String, id: Id },
    #[error("{transport}: transient failure: {message}")]
    Transient { transport: String, message: String },
    #[error("{transport}: rejected: {message}")]
    Rejected {
        transport: String,
        id: Option<Id>,
        message: String,
    },
    #[error("{transport}: transport closed")]
    Closed { transport: String },
    #[error("{transport}: {message}")]
    Backend { transport: String, message: String },
}

impl TransportError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound { .. })
    }

    /// The transport that produced the error.
    pub fn transport(&self) -> &str {
        match self {
            TransportError::NotFound { transport, .. }
            | TransportError::Transient { transport, .. }
            | TransportError::Rejected { transport, .. }
            | TransportError::Closed { transport }
            | TransportError::Backend { transport, .. } => transport,
        }
    }
}

/// Storage backend for records.
///
/// Records are opaque bytes keyed by their content hash. Saves are idempotent
/// and may be buffered; [`Transport::flush`] is the only ordering barrier.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Label used in progress reports and errors.
    fn name(&self) -> &str;

    /// Stores a record. Saving an id that is already present is a no-op.
    async fn save(&self, id: Id, content: Vec<u8>) -> Result<(), TransportError>;

    /// Batch save - default impl calls save() in sequence.
    async fn save_many(&self, records: Vec<(Id, Vec<u8>)>) -> Result<(), TransportError> {
        for (id, content) in records {
            self.save(id, content).await?;
        }
        Ok(())
    }

    /// Returns the subset of `ids` this transport holds.
    async fn exists(&self, ids: &[Id]) -> Result<HashSet<Id>, TransportError>;

    /// Loads one record, failing with [`TransportError::NotFound`] if absent.
    async fn load(&self, id: &Id) -> Result<Vec<u8>, TransportError>;

    /// Batch load of the found subset - default impl calls load() in sequence.
    async fn load_many(&self, ids: &[Id]) -> Result<Vec<(Id, Vec<u8>)>, TransportError> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(id).await {
                Ok(content) => found.push((*id, content)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Waits until every earlier accepted save is durable.
    async fn flush(&self) -> Result<(), TransportError>;
}

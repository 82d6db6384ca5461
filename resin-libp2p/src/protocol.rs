//! Protocol messages for Resin object sync over libp2p.

use resin_core::Id;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_NAME: &str = "/resin/objects/1.0.0";

/// A record on the wire. The content travels as a CBOR byte string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Id,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

impl From<(Id, Vec<u8>)> for StoredRecord {
    fn from((id, content): (Id, Vec<u8>)) -> Self {
        StoredRecord { id, content }
    }
}

impl From<StoredRecord> for (Id, Vec<u8>) {
    fn from(record: StoredRecord) -> Self {
        (record.id, record.content)
    }
}

/// Request types for the object protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Get records for the given ids.
    Get { ids: Vec<Id> },
    /// Check which ids exist.
    Has { ids: Vec<Id> },
    /// Store records. Answered once the records are durable.
    Put { records: Vec<StoredRecord> },
}

impl Request {
    /// First id named by the request, for error reports.
    pub fn first_id(&self) -> Option<Id> {
        match self {
            Request::Get { ids } | Request::Has { ids } => ids.first().copied(),
            Request::Put { records } => records.first().map(|record| record.id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Get { .. } => "get",
            Request::Has { .. } => "has",
            Request::Put { .. } => "put",
        }
    }
}

/// Response types for the object protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Response to Get: found records and missing ids.
    ///
    /// Requested ids in neither list were left out to bound the response
    /// size and should be asked for again.
    Records {
        found: Vec<StoredRecord>,
        missing: Vec<Id>,
    },
    /// Response to Has: presence flags in same order as request.
    Has { present: Vec<bool> },
    /// Response to Put: ids that were stored.
    Stored { ids: Vec<Id> },
    /// Error response. `transient` errors may succeed on retry.
    Error { message: String, transient: bool },
}

//! Resin is a content-addressed object-graph synchronization engine.
//!
//! Core concepts:
//! - **Node**: A dynamically-typed property bag with a type tag, shared through [`NodeRef`]
//! - **Id**: A 256-bit content hash uniquely identifying a record
//! - **Record**: The serialized form of a node, keyed by its id
//! - **Decomposer**: Splits a node graph into deduplicated records, detaching and chunking per key
//! - **Transport**: A pluggable store for records (memory, local cache, remote peer)
//! - **Sync**: [`send`] uploads a graph to several transports; [`receive`] fetches and rebuilds it
//!
//! # Example
//!
//! ```
//! use resin_core::{Decomposer, Node};
//!
//! let root = Node::base()
//!     .with("a", 1)
//!     .with_detached("b", Node::base().with("c", 2))
//!     .into_ref();
//!
//! let result = Decomposer::default().decompose(&root);
//! assert_eq!(result.len(), 2);
//! println!("Root: {}", result.root_id);
//! ```
//!
//! # Key naming
//!
//! Keys starting with `@` are detached; `@(n)` chunks sequences longer than
//! `n` elements. Keys starting with `__` are bookkeeping and never hashed or
//! stored.

mod codec;
mod config;
mod decompose;
mod hash;
mod id;
mod memory;
mod node;
mod progress;
mod reconstruct;
mod sync;
mod transport;
mod version;

pub use codec::{CodecError, DecodedRecord, decode_closure_of, decode_record, parse_fields};
pub use config::{
    ConfigError, DecomposeConfig, LocalCacheConfig, ReceiveConfig, RemoteConfig, SendConfig,
    SyncConfig,
};
pub use decompose::{
    DEFAULT_CHUNK_SIZE, DecomposeError, DecomposeWarning, Decomposer, Decomposition,
};
pub use hash::{Blake3Hasher, ContentHasher, HashPolicy, Sha256Hasher, default_ignored_key};
pub use id::{Id, ParseIdError};
pub use memory::MemoryTransport;
pub use node::{
    BASE_TYPE, CHUNK_DATA_KEY, CHUNK_TYPE, CLOSURE_KEY, ID_KEY, KeyPolicy, Node, NodeError,
    NodeRef, REFERENCE_TYPE, REFERENCED_ID_KEY, TYPE_KEY, Value,
};
pub use progress::{ProgressCallback, ProgressSnapshot, ProgressTracker};
pub use reconstruct::{RECONSTRUCT_LABEL, ReconstructError, Reconstructor};
pub use sync::{
    ReceiveError, ReceiveOptions, SendError, SendOptions, SendReport, TransportOutcome,
    copy_with_children, receive, send,
};
pub use transport::{Transport, TransportError};
pub use tokio_util::sync::CancellationToken;
pub use version::{
    CreateVersion, DEFAULT_SOURCE_APPLICATION, VersionCreator, VersionError,
    create_version_after_send,
};

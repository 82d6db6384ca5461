//! Content hashing.
//!
//! A record's id is the digest of its canonical form: the CBOR encoding of
//! its fields sorted by key, with the record's own `id`, its closure table and
//! every ignored key left out.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sha2::Digest;

use crate::codec::{self, CodecError};
use crate::id::Id;
use crate::node::{CLOSURE_KEY, ID_KEY, NodeRef};

/// A 256-bit digest function.
pub trait ContentHasher: Send + Sync {
    fn digest(&self, data: &[u8]) -> Id;
}

/// BLAKE3-256, the default digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn digest(&self, data: &[u8]) -> Id {
        Id::from_bytes(*blake3::hash(data).as_bytes())
    }
}

/// SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn digest(&self, data: &[u8]) -> Id {
        let digest = sha2::Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Id::from_bytes(bytes)
    }
}

type KeyPredicate = dyn Fn(&str) -> bool + Send + Sync;

/// Hash function plus the predicate deciding which keys are bookkeeping.
///
/// Ignored keys are left out of both the digest and the stored record.
#[derive(Clone)]
pub struct HashPolicy {
    hasher: Arc<dyn ContentHasher>,
    ignored: Arc<KeyPredicate>,
}

/// The default ignored-key predicate: anything starting with `__`.
pub fn default_ignored_key(key: &str) -> bool {
    key.starts_with("__")
}

impl HashPolicy {
    pub fn new(
        hasher: impl ContentHasher + 'static,
        ignored: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        HashPolicy {
            hasher: Arc::new(hasher),
            ignored: Arc::new(ignored),
        }
    }

    /// Uses a different digest with the default ignored-key predicate.
    pub fn with_hasher(hasher: impl ContentHasher + 'static) -> Self {
        HashPolicy::new(hasher, default_ignored_key)
    }

    /// Returns true if the key is excluded from hashing and storage.
    pub fn is_ignored(&self, key: &str) -> bool {
        key == ID_KEY || key == CLOSURE_KEY || (self.ignored)(key)
    }

    /// Digests already-encoded record fields.
    pub fn digest_fields(&self, fields: &BTreeMap<String, ciborium::Value>) -> Id {
        let canonical = ciborium::Value::Map(
            fields
                .iter()
                .filter(|(key, _)| !self.is_ignored(key))
                .map(|(key, value)| (ciborium::Value::Text(key.clone()), value.clone()))
                .collect(),
        );
        self.hasher.digest(&codec::to_cbor(&canonical))
    }

    /// Hashes a node with every nested node inlined.
    ///
    /// This is the id the node would get as a record if none of its keys
    /// were detached. Use the decomposer to get the id under the node's
    /// detach policies.
    pub fn hash(&self, node: &NodeRef) -> Id {
        let fields = codec::inline_fields(node, self);
        self.digest_fields(&fields)
    }

    /// Checks that stored record bytes hash to the given id.
    pub fn verify(&self, id: &Id, bytes: &[u8]) -> Result<bool, CodecError> {
        let fields = codec::parse_fields(bytes)?;
        Ok(self.digest_fields(&fields) == *id)
    }
}

impl Default for HashPolicy {
    fn default() -> Self {
        HashPolicy::new(Blake3Hasher, default_ignored_key)
    }
}

impl fmt::Debug for HashPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashPolicy").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, Value};

    #[test]
    fn hash_ignores_insertion_order() {
        let policy = HashPolicy::default();
        let mut a = Node::base();
        a.insert("x", 1);
        a.insert("y", "two");
        let mut b = Node::base();
        b.insert("y", "two");
        b.insert("x", 1);
        assert_eq!(
            policy.hash(&a.into_ref()),
            policy.hash(&b.into_ref())
        );
    }

    #[test]
    fn hash_ignores_bookkeeping_keys() {
        let policy = HashPolicy::default();
        let a = Node::base().with("x", 1).into_ref();
        let b = Node::base().with("x", 1).with("__cache", "whatever").into_ref();
        assert_eq!(policy.hash(&a), policy.hash(&b));
    }

    #[test]
    fn hash_distinguishes_values_and_types() {
        let policy = HashPolicy::default();
        let base = policy.hash(&Node::base().with("x", 1).into_ref());
        let other_value = policy.hash(&Node::base().with("x", 2).into_ref());
        let other_float = policy.hash(&Node::base().with("x", 1.0).into_ref());
        let other_type = policy.hash(&Node::new("Point").with("x", 1).into_ref());
        assert_ne!(base, other_value);
        assert_ne!(base, other_float);
        assert_ne!(base, other_type);
    }

    #[test]
    fn hash_of_deep_copy_matches() {
        let policy = HashPolicy::default();
        let root = Node::base()
            .with("name", "wall")
            .with(
                "points",
                Value::List(vec![Node::new("Point").with("x", 1.5).into(), Value::Null]),
            )
            .into_ref();
        assert_eq!(
            policy.hash(&root),
            policy.hash(&root.deep_copy())
        );
    }

    #[test]
    fn custom_predicate_and_hasher() {
        let policy = HashPolicy::new(Sha256Hasher, |key: &str| key.starts_with('_'));
        let a = Node::base().with("x", 1).with("_scratch", 3).into_ref();
        let b = Node::base().with("x", 1).into_ref();
        assert_eq!(policy.hash(&a), policy.hash(&b));
        assert_ne!(
            policy.hash(&b),
            HashPolicy::default().hash(&b)
        );
    }
}

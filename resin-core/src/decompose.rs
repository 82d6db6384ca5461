//! Decomposition of a node graph into content-addressed records.
//!
//! The walk is depth-first: every detached child is hashed and recorded
//! before its parent, so [`Decomposition::records`] lists children first
//! and the root last.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, encode_record, fields_to_map, placeholder};
use crate::hash::HashPolicy;
use crate::id::Id;
use crate::node::{CHUNK_DATA_KEY, CHUNK_TYPE, KeyPolicy, NodeRef, TYPE_KEY, Value};

/// Chunk size used for `@()` keys and `Chunk(None)` policies.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Error type for decomposition.
#[derive(Debug, thiserror::Error)]
pub enum DecomposeError {
    #[error("decomposition cancelled")]
    Cancelled,
}

/// A recoverable problem found in the input graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecomposeWarning {
    /// The edge under `key` pointed back at a node still being decomposed
    /// and was replaced by null.
    Cycle { key: String },
}

/// The records produced from one root.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub root_id: Id,
    /// Serialized records, children before parents.
    pub records: IndexMap<Id, Vec<u8>>,
    /// Closure table of every record, empty for leaves.
    pub closures: HashMap<Id, BTreeMap<Id, u32>>,
    pub warnings: Vec<DecomposeWarning>,
}

impl Decomposition {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> Vec<Id> {
        self.records.keys().copied().collect()
    }

    /// Closure of the root record.
    pub fn root_closure(&self) -> &BTreeMap<Id, u32> {
        self.closure(&self.root_id)
    }

    pub fn closure(&self, id: &Id) -> &BTreeMap<Id, u32> {
        static EMPTY: BTreeMap<Id, u32> = BTreeMap::new();
        self.closures.get(id).unwrap_or(&EMPTY)
    }
}

/// Turns node graphs into records.
#[derive(Debug, Clone)]
pub struct Decomposer {
    policy: HashPolicy,
    chunk_size: usize,
}

impl Decomposer {
    pub fn new(policy: HashPolicy) -> Self {
        Decomposer {
            policy,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the size used by chunk policies that do not carry one.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn policy(&self) -> &HashPolicy {
        &self.policy
    }

    pub fn decompose(&self, root: &NodeRef) -> Decomposition {
        match self.decompose_cancellable(root, &CancellationToken::new()) {
            Ok(decomposition) => decomposition,
            Err(DecomposeError::Cancelled) => unreachable!("fresh token is never cancelled"),
        }
    }

    /// Decomposes `root`, checking `cancel` before every node.
    pub fn decompose_cancellable(
        &self,
        root: &NodeRef,
        cancel: &CancellationToken,
    ) -> Result<Decomposition, DecomposeError> {
        let mut run = Run {
            decomposer: self,
            cancel,
            records: IndexMap::new(),
            closures: HashMap::new(),
            memo: HashMap::new(),
            stack: Vec::new(),
            warnings: Vec::new(),
        };
        let root_id = run.record(root)?;
        tracing::debug!(
            root = %root_id,
            records = run.records.len(),
            warnings = run.warnings.len(),
            "decomposed graph"
        );
        Ok(Decomposition {
            root_id,
            records: run.records,
            closures: run.closures,
            warnings: run.warnings,
        })
    }
}

impl Default for Decomposer {
    fn default() -> Self {
        Decomposer::new(HashPolicy::default())
    }
}

type Fields = BTreeMap<String, ciborium::Value>;

struct Run<'a> {
    decomposer: &'a Decomposer,
    cancel: &'a CancellationToken,
    records: IndexMap<Id, Vec<u8>>,
    closures: HashMap<Id, BTreeMap<Id, u32>>,
    /// Handle address to record id, for nodes already recorded this run.
    memo: HashMap<usize, Id>,
    /// Handle addresses of nodes currently being encoded.
    stack: Vec<usize>,
    warnings: Vec<DecomposeWarning>,
}

impl Run<'_> {
    /// Records `node` as its own record and returns its id.
    fn record(&mut self, node: &NodeRef) -> Result<Id, DecomposeError> {
        let addr = node.addr();
        if let Some(id) = self.memo.get(&addr) {
            return Ok(*id);
        }
        self.stack.push(addr);
        let mut closure = BTreeMap::new();
        let fields = self.encode_node(node, &mut closure);
        self.stack.pop();
        let id = self.emit(fields?, closure);
        node.read().cache_id(id);
        self.memo.insert(addr, id);
        Ok(id)
    }

    /// Hashes and stores a record unless an identical one exists.
    fn emit(&mut self, fields: Fields, closure: BTreeMap<Id, u32>) -> Id {
        let id = self.decomposer.policy.digest_fields(&fields);
        if !self.records.contains_key(&id) {
            self.records
                .insert(id, encode_record(fields, &closure, &id));
            self.closures.insert(id, closure);
        }
        id
    }

    fn encode_node(
        &mut self,
        node: &NodeRef,
        refs: &mut BTreeMap<Id, u32>,
    ) -> Result<Fields, DecomposeError> {
        if self.cancel.is_cancelled() {
            return Err(DecomposeError::Cancelled);
        }
        let node = node.read();
        let mut fields = Fields::new();
        fields.insert(
            TYPE_KEY.to_string(),
            ciborium::Value::Text(node.type_tag().to_string()),
        );
        for (key, value) in node.iter() {
            if self.decomposer.policy.is_ignored(key) {
                continue;
            }
            let encoded = match node.policy(key) {
                KeyPolicy::Inline => self.inline(key, value, refs)?,
                KeyPolicy::Detach => self.detach(key, value, refs)?,
                KeyPolicy::Chunk(size) => {
                    let size = size.unwrap_or(self.decomposer.chunk_size).max(1);
                    match value {
                        Value::List(items) if items.len() > size => {
                            self.chunk(key, items, size, refs)?
                        }
                        _ => self.detach(key, value, refs)?,
                    }
                }
            };
            fields.insert(key.clone(), encoded);
        }
        Ok(fields)
    }

    fn inline(
        &mut self,
        key: &str,
        value: &Value,
        refs: &mut BTreeMap<Id, u32>,
    ) -> Result<ciborium::Value, DecomposeError> {
        if let Some(encoded) = codec::scalar(value) {
            if let Value::Reference(id) = value {
                merge_min(refs, *id, 0);
            }
            return Ok(encoded);
        }
        match value {
            Value::List(items) => Ok(ciborium::Value::Array(
                items
                    .iter()
                    .map(|item| self.inline(key, item, refs))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Node(child) => {
                if self.is_cycle(key, child) {
                    return Ok(ciborium::Value::Null);
                }
                self.stack.push(child.addr());
                let fields = self.encode_node(child, refs);
                self.stack.pop();
                Ok(fields_to_map(fields?))
            }
            _ => Ok(ciborium::Value::Null),
        }
    }

    fn detach(
        &mut self,
        key: &str,
        value: &Value,
        refs: &mut BTreeMap<Id, u32>,
    ) -> Result<ciborium::Value, DecomposeError> {
        match value {
            Value::Node(child) => {
                if self.is_cycle(key, child) {
                    return Ok(ciborium::Value::Null);
                }
                let id = self.record(child)?;
                self.add_child(refs, id);
                Ok(placeholder(&id))
            }
            Value::List(items) => Ok(ciborium::Value::Array(
                items
                    .iter()
                    .map(|item| self.detach(key, item, refs))
                    .collect::<Result<_, _>>()?,
            )),
            other => self.inline(key, other, refs),
        }
    }

    fn chunk(
        &mut self,
        key: &str,
        items: &[Value],
        size: usize,
        refs: &mut BTreeMap<Id, u32>,
    ) -> Result<ciborium::Value, DecomposeError> {
        let mut placeholders = Vec::with_capacity(items.len().div_ceil(size));
        for slice in items.chunks(size) {
            let mut chunk_refs = BTreeMap::new();
            let data = slice
                .iter()
                .map(|item| self.inline(key, item, &mut chunk_refs))
                .collect::<Result<_, _>>()?;
            let mut fields = Fields::new();
            fields.insert(
                TYPE_KEY.to_string(),
                ciborium::Value::Text(CHUNK_TYPE.to_string()),
            );
            fields.insert(CHUNK_DATA_KEY.to_string(), ciborium::Value::Array(data));
            let id = self.emit(fields, chunk_refs);
            self.add_child(refs, id);
            placeholders.push(placeholder(&id));
        }
        Ok(ciborium::Value::Array(placeholders))
    }

    fn is_cycle(&mut self, key: &str, child: &NodeRef) -> bool {
        if !self.stack.contains(&child.addr()) {
            return false;
        }
        tracing::warn!(key, "dropping edge that closes a cycle");
        self.warnings.push(DecomposeWarning::Cycle {
            key: key.to_string(),
        });
        true
    }

    /// Adds a detached child at depth 0 and its own closure one level deeper.
    fn add_child(&self, refs: &mut BTreeMap<Id, u32>, id: Id) {
        merge_min(refs, id, 0);
        if let Some(closure) = self.closures.get(&id) {
            for (descendant, depth) in closure {
                merge_min(refs, *descendant, depth + 1);
            }
        }
    }
}

fn merge_min(refs: &mut BTreeMap<Id, u32>, id: Id, depth: u32) {
    refs.entry(id)
        .and_modify(|d| *d = (*d).min(depth))
        .or_insert(depth);
}

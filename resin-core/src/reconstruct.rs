//! Rebuilding node graphs from stored records.

use std::collections::{BTreeMap, HashMap, HashSet};

use tokio_util::sync::CancellationToken;

use crate::codec::{CodecError, DecodedRecord, decode_record};
use crate::id::Id;
use crate::node::{CHUNK_DATA_KEY, CHUNK_TYPE, KeyPolicy, Node, NodeRef, Value};
use crate::progress::ProgressTracker;
use crate::transport::{Transport, TransportError};

/// Progress label used while resolving records.
pub const RECONSTRUCT_LABEL: &str = "reconstruct";

/// Error type for reconstruction.
#[derive(Debug, thiserror::Error)]
pub enum ReconstructError {
    #[error("object {0} not found in any transport")]
    NotFound(Id),
    #[error("object {id} is malformed: {source}")]
    Malformed {
        id: Id,
        #[source]
        source: CodecError,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("reconstruction cancelled")]
    Cancelled,
}

/// Resolves a root id through an ordered chain of transports.
///
/// The first transport holding an id wins. Identical subtrees are shared:
/// every reference to the same id yields the same [`NodeRef`].
pub struct Reconstructor<'a> {
    chain: Vec<&'a dyn Transport>,
    progress: Option<&'a ProgressTracker>,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> Reconstructor<'a> {
    pub fn new(chain: Vec<&'a dyn Transport>) -> Self {
        Reconstructor {
            chain,
            progress: None,
            cancel: None,
        }
    }

    pub fn with_progress(mut self, progress: &'a ProgressTracker) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[tracing::instrument(skip(self), fields(root = %root_id))]
    pub async fn reconstruct(&self, root_id: &Id) -> Result<NodeRef, ReconstructError> {
        let records = self.load_graph(root_id).await?;
        let mut builder = Builder {
            records: &records,
            memo: HashMap::new(),
        };
        let root = builder.node(root_id)?;
        tracing::debug!(records = records.len(), "reconstructed graph");
        Ok(root)
    }

    /// Loads every record reachable from `root_id`, one level at a time.
    async fn load_graph(&self, root_id: &Id) -> Result<HashMap<Id, DecodedRecord>, ReconstructError> {
        let mut records = HashMap::new();
        let mut queued = HashSet::from([*root_id]);
        let mut level = vec![*root_id];

        while !level.is_empty() {
            self.check_cancelled()?;
            let loaded = self.load_level(&level).await?;
            let mut next = Vec::new();
            for (id, bytes) in loaded {
                let record = decode_record(&bytes)
                    .map_err(|source| ReconstructError::Malformed { id, source })?;
                for child in record.references() {
                    if queued.insert(child) {
                        next.push(child);
                    }
                }
                records.insert(id, record);
            }
            if let Some(progress) = self.progress {
                progress.advance(RECONSTRUCT_LABEL, level.len() as u64);
            }
            level = next;
        }
        Ok(records)
    }

    async fn load_level(&self, ids: &[Id]) -> Result<Vec<(Id, Vec<u8>)>, ReconstructError> {
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = ids.to_vec();
        for transport in &self.chain {
            if missing.is_empty() {
                break;
            }
            self.check_cancelled()?;
            let batch = transport.load_many(&missing).await?;
            let hits: HashSet<Id> = batch.iter().map(|(id, _)| *id).collect();
            tracing::debug!(
                transport = transport.name(),
                requested = missing.len(),
                found = hits.len(),
                "resolved records"
            );
            missing.retain(|id| !hits.contains(id));
            found.extend(batch);
        }
        match missing.first() {
            Some(id) => Err(ReconstructError::NotFound(*id)),
            None => Ok(found),
        }
    }

    fn check_cancelled(&self) -> Result<(), ReconstructError> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(ReconstructError::Cancelled),
            _ => Ok(()),
        }
    }
}

struct Builder<'r> {
    records: &'r HashMap<Id, DecodedRecord>,
    memo: HashMap<Id, NodeRef>,
}

impl<'r> Builder<'r> {
    fn record(&self, id: &Id) -> Result<&'r DecodedRecord, ReconstructError> {
        let records = self.records;
        records.get(id).ok_or(ReconstructError::NotFound(*id))
    }

    fn node(&mut self, id: &Id) -> Result<NodeRef, ReconstructError> {
        if let Some(node) = self.memo.get(id) {
            return Ok(node.clone());
        }
        let record = self.record(id)?;
        let node = self.build(&record.type_tag, &record.props)?;
        node.read().cache_id(*id);
        self.memo.insert(*id, node.clone());
        Ok(node)
    }

    fn build(
        &mut self,
        type_tag: &str,
        props: &BTreeMap<String, Value>,
    ) -> Result<NodeRef, ReconstructError> {
        let mut node = Node::from_parts(type_tag.to_string(), BTreeMap::new());
        for (key, value) in props {
            let (value, policy) = self.value(value)?;
            match policy {
                Some(policy) if KeyPolicy::from_key(key) == KeyPolicy::Inline => {
                    node.set_policy(key.clone(), policy);
                }
                _ => {}
            }
            node.insert(key.clone(), value);
        }
        Ok(node.into_ref())
    }

    /// Resolves references in a property value.
    ///
    /// Also returns the key policy that re-creates the stored layout.
    fn value(&mut self, value: &Value) -> Result<(Value, Option<KeyPolicy>), ReconstructError> {
        match value {
            Value::Reference(id) => {
                if self.record(id)?.type_tag == CHUNK_TYPE {
                    let items = self.chunk_items(id)?;
                    return Ok((Value::List(items), Some(KeyPolicy::Detach)));
                }
                Ok((Value::Node(self.node(id)?), Some(KeyPolicy::Detach)))
            }
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                let mut policy = None;
                let mut first_chunk = None;
                for item in items {
                    if let Value::Reference(id) = item {
                        if self.record(id)?.type_tag == CHUNK_TYPE {
                            let chunk = self.chunk_items(id)?;
                            first_chunk.get_or_insert(chunk.len());
                            out.extend(chunk);
                            continue;
                        }
                    }
                    let (item, item_policy) = self.value(item)?;
                    policy = policy.or(item_policy);
                    out.push(item);
                }
                let policy = match first_chunk {
                    Some(size) => Some(KeyPolicy::Chunk(Some(size))),
                    None => policy,
                };
                Ok((Value::List(out), policy))
            }
            Value::Node(inline) => {
                let (type_tag, props) = {
                    let inline = inline.read();
                    let props: BTreeMap<String, Value> = inline
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    (inline.type_tag().to_string(), props)
                };
                Ok((Value::Node(self.build(&type_tag, &props)?), None))
            }
            other => Ok((other.clone(), None)),
        }
    }

    fn chunk_items(&mut self, id: &Id) -> Result<Vec<Value>, ReconstructError> {
        let data: &'r [Value] = match self.record(id)?.props.get(CHUNK_DATA_KEY) {
            Some(Value::List(items)) => items,
            _ => &[],
        };
        data.iter()
            .map(|item| self.value(item).map(|(value, _)| value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::Decomposer;
    use crate::memory::MemoryTransport;

    async fn store(root: &NodeRef, decomposer: &Decomposer) -> (Id, MemoryTransport) {
        let result = decomposer.decompose(root);
        let memory = MemoryTransport::new();
        memory
            .save_many(result.records.into_iter().collect())
            .await
            .unwrap();
        (result.root_id, memory)
    }

    #[tokio::test]
    async fn detached_children_round_trip() {
        let root = Node::base()
            .with("a", 1)
            .with_detached("b", Node::base().with("c", 2))
            .into_ref();
        let (root_id, memory) = store(&root, &Decomposer::default()).await;

        let rebuilt = Reconstructor::new(vec![&memory])
            .reconstruct(&root_id)
            .await
            .unwrap();
        assert_eq!(rebuilt, root);
        assert_eq!(rebuilt.read().id(), Some(root_id));
        assert_eq!(Decomposer::default().decompose(&rebuilt).root_id, root_id);
    }

    #[tokio::test]
    async fn chunks_are_spliced_back() {
        let numbers: Vec<Value> = (0..23).map(Value::from).collect();
        let root = Node::base()
            .with_chunked("values", Value::List(numbers.clone()), 5)
            .into_ref();
        let (root_id, memory) = store(&root, &Decomposer::default()).await;

        let rebuilt = Reconstructor::new(vec![&memory])
            .reconstruct(&root_id)
            .await
            .unwrap();
        assert_eq!(rebuilt.read().get("values"), Some(&Value::List(numbers)));
        assert_eq!(rebuilt.read().policy("values"), KeyPolicy::Chunk(Some(5)));
        assert_eq!(Decomposer::default().decompose(&rebuilt).root_id, root_id);
    }

    #[tokio::test]
    async fn shared_subtrees_share_handles() {
        let shared = Node::base().with("v", 7).into_ref();
        let root = Node::base()
            .with("@left", shared.clone())
            .with("@right", shared)
            .into_ref();
        let (root_id, memory) = store(&root, &Decomposer::default()).await;

        let rebuilt = Reconstructor::new(vec![&memory])
            .reconstruct(&root_id)
            .await
            .unwrap();
        let rebuilt = rebuilt.read();
        let left = rebuilt.get("@left").and_then(Value::as_node).unwrap();
        let right = rebuilt.get("@right").and_then(Value::as_node).unwrap();
        assert!(left.ptr_eq(right));
    }

    #[tokio::test]
    async fn chain_falls_through_to_later_transports() {
        let root = Node::base()
            .with_detached("child", Node::base().with("x", 1))
            .into_ref();
        let result = Decomposer::default().decompose(&root);
        let first = MemoryTransport::named("first");
        let second = MemoryTransport::named("second");
        let (root_record, rest): (Vec<_>, Vec<_>) = result
            .records
            .into_iter()
            .partition(|(id, _)| *id == result.root_id);
        first.save_many(root_record).await.unwrap();
        second.save_many(rest).await.unwrap();

        let progress = ProgressTracker::new();
        let rebuilt = Reconstructor::new(vec![&first, &second])
            .with_progress(&progress)
            .reconstruct(&result.root_id)
            .await
            .unwrap();
        assert_eq!(rebuilt, root);
        assert_eq!(progress.get(RECONSTRUCT_LABEL), 2);
    }

    #[tokio::test]
    async fn missing_child_is_fatal() {
        let child = Node::base().with("x", 1).into_ref();
        let root = Node::base().with_detached("child", child.clone()).into_ref();
        let result = Decomposer::default().decompose(&root);
        let memory = MemoryTransport::new();
        memory
            .save(result.root_id, result.records[&result.root_id].clone())
            .await
            .unwrap();

        let err = Reconstructor::new(vec![&memory])
            .reconstruct(&result.root_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconstructError::NotFound(id) if Some(id) == child.read().id()));
    }

    #[tokio::test]
    async fn cancellation_is_honoured() {
        let root = Node::base().with("x", 1).into_ref();
        let (root_id, memory) = store(&root, &Decomposer::default()).await;
        let token = CancellationToken::new();
        token.cancel();

        let err = Reconstructor::new(vec![&memory])
            .with_cancellation(&token)
            .reconstruct(&root_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconstructError::Cancelled));
    }
}

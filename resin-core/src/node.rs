use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::id::Id;

/// Type tag given to nodes created with [`Node::base`].
pub const BASE_TYPE: &str = "Base";
/// Type tag of a reference placeholder.
pub const REFERENCE_TYPE: &str = "reference";
/// Type tag of a record holding one slice of a chunked sequence.
pub const CHUNK_TYPE: &str = "chunk";

/// Key holding the type discriminator in serialized form.
pub const TYPE_KEY: &str = "type";
/// Key holding a record's own id in serialized form.
pub const ID_KEY: &str = "id";
/// Key holding the referenced id inside a reference placeholder.
pub const REFERENCED_ID_KEY: &str = "referencedId";
/// Key holding the closure table inside a stored record.
pub const CLOSURE_KEY: &str = "__closure";
/// Key holding the elements of a chunk record.
pub const CHUNK_DATA_KEY: &str = "data";

/// A dynamically-typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// A nested node, inlined or detached depending on the key policy.
    Node(NodeRef),
    /// A reference placeholder standing in for a detached record.
    Reference(Id),
}

impl Value {
    pub fn as_node(&self) -> Option<&NodeRef> {
        match self {
            Value::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<NodeRef> for Value {
    fn from(v: NodeRef) -> Self {
        Value::Node(v)
    }
}

impl From<Node> for Value {
    fn from(v: Node) -> Self {
        Value::Node(NodeRef::new(v))
    }
}

/// How the decomposer stores the value under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Serialize the value inside the parent's record.
    Inline,
    /// Store nested nodes as their own records and keep references in the parent.
    Detach,
    /// Split sequences longer than the chunk size into chunk records.
    /// `None` uses the decomposer's configured default size.
    Chunk(Option<usize>),
}

impl KeyPolicy {
    /// Derives a policy from the key naming convention.
    ///
    /// `@name` detaches, `@(n)name` chunks with size `n`, and `@()name`
    /// chunks with the default size. Anything else is inlined.
    pub fn from_key(key: &str) -> Self {
        let Some(rest) = key.strip_prefix('@') else {
            return KeyPolicy::Inline;
        };
        let Some(inner) = rest.strip_prefix('(') else {
            return KeyPolicy::Detach;
        };
        match inner.split_once(')') {
            Some((digits, _)) => match digits.parse::<usize>() {
                Ok(n) if n > 0 => KeyPolicy::Chunk(Some(n)),
                _ => KeyPolicy::Chunk(None),
            },
            None => KeyPolicy::Detach,
        }
    }
}

/// Error building a node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("type tag `{0}` is reserved for stored records")]
    ReservedType(String),
}

/// A node of the object graph: a type tag plus a sorted property bag.
///
/// The keys `id` and `type` are structural and cannot be used as property
/// names. The type tags `reference` and `chunk` mark placeholders and chunk
/// records and cannot be given to nodes.
pub struct Node {
    type_tag: String,
    props: BTreeMap<String, Value>,
    policies: BTreeMap<String, KeyPolicy>,
    id: Mutex<Option<Id>>,
}

impl Node {
    /// Creates a node with the given type tag.
    ///
    /// # Panics
    ///
    /// Panics if the tag is reserved. Use [`Node::try_new`] for tags that
    /// come from outside the program.
    pub fn new(type_tag: impl Into<String>) -> Self {
        match Node::try_new(type_tag) {
            Ok(node) => node,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn try_new(type_tag: impl Into<String>) -> Result<Self, NodeError> {
        let type_tag = type_tag.into();
        if is_reserved_type(&type_tag) {
            return Err(NodeError::ReservedType(type_tag));
        }
        Ok(Node::from_parts(type_tag, BTreeMap::new()))
    }

    /// Creates an untyped node.
    pub fn base() -> Self {
        Node::new(BASE_TYPE)
    }

    pub(crate) fn from_parts(type_tag: String, props: BTreeMap<String, Value>) -> Self {
        Node {
            type_tag,
            props,
            policies: BTreeMap::new(),
            id: Mutex::new(None),
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Sets a property. Reserved keys are ignored.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        if is_reserved(&key) {
            tracing::warn!(key = %key, "ignoring reserved property name");
            return None;
        }
        self.clear_id();
        self.props.insert(key, value.into())
    }

    /// Sets a property and marks it for detachment.
    pub fn insert_detached(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Option<Value> {
        let key = key.into();
        self.set_policy(key.clone(), KeyPolicy::Detach);
        self.insert(key, value)
    }

    /// Sets a sequence property that is chunked when longer than `chunk_size`.
    pub fn insert_chunked(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
        chunk_size: usize,
    ) -> Option<Value> {
        let key = key.into();
        self.set_policy(key.clone(), KeyPolicy::Chunk(Some(chunk_size.max(1))));
        self.insert(key, value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.clear_id();
        self.policies.remove(key);
        self.props.remove(key)
    }

    /// Overrides the policy derived from the key name.
    pub fn set_policy(&mut self, key: impl Into<String>, policy: KeyPolicy) {
        self.clear_id();
        self.policies.insert(key.into(), policy);
    }

    /// Returns the effective policy for a key.
    pub fn policy(&self, key: &str) -> KeyPolicy {
        self.policies
            .get(key)
            .copied()
            .unwrap_or_else(|| KeyPolicy::from_key(key))
    }

    /// Iterates properties in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.props.iter()
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// The id assigned by the last decomposition or load, if any.
    ///
    /// Mutating a descendant does not clear it; decompose again to refresh.
    pub fn id(&self) -> Option<Id> {
        *self.id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cache_id(&self, id: Id) {
        *self.id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    fn clear_id(&mut self) {
        *self.id.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Builder form of [`Node::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Builder form of [`Node::insert_detached`].
    pub fn with_detached(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert_detached(key, value);
        self
    }

    /// Builder form of [`Node::insert_chunked`].
    pub fn with_chunked(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
        chunk_size: usize,
    ) -> Self {
        self.insert_chunked(key, value, chunk_size);
        self
    }

    pub fn into_ref(self) -> NodeRef {
        NodeRef::new(self)
    }
}

fn is_reserved(key: &str) -> bool {
    key == ID_KEY || key == TYPE_KEY
}

fn is_reserved_type(type_tag: &str) -> bool {
    type_tag == REFERENCE_TYPE || type_tag == CHUNK_TYPE
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Node {
            type_tag: self.type_tag.clone(),
            props: self.props.clone(),
            policies: self.policies.clone(),
            id: Mutex::new(self.id()),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.type_tag == other.type_tag && self.props == other.props
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("type", &self.type_tag)
            .field("id", &self.id())
            .field("props", &self.props)
            .finish()
    }
}

/// A shared, mutable handle to a node.
///
/// Producers share subtrees by cloning the handle. Handle identity is what
/// the decomposer uses to recognise shared subtrees and reference cycles.
#[derive(Clone)]
pub struct NodeRef(Arc<RwLock<Node>>);

impl NodeRef {
    pub fn new(node: Node) -> Self {
        NodeRef(Arc::new(RwLock::new(node)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Node> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if both handles point at the same node.
    pub fn ptr_eq(&self, other: &NodeRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Deep-copies the subtree into fresh handles.
    ///
    /// Shared handles are copied once per occurrence; cyclic graphs must not
    /// be deep-copied.
    pub fn deep_copy(&self) -> NodeRef {
        let node = self.read();
        let mut copy = Node::from_parts(node.type_tag.clone(), BTreeMap::new());
        copy.policies = node.policies.clone();
        for (key, value) in &node.props {
            copy.props.insert(key.clone(), deep_copy_value(value));
        }
        NodeRef::new(copy)
    }
}

fn deep_copy_value(value: &Value) -> Value {
    match value {
        Value::Node(node) => Value::Node(node.deep_copy()),
        Value::List(items) => Value::List(items.iter().map(deep_copy_value).collect()),
        other => other.clone(),
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || *self.read() == *other.read()
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(node) => node.fmt(f),
            Err(_) => f.write_str("NodeRef(<locked>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_from_key_name() {
        assert_eq!(KeyPolicy::from_key("name"), KeyPolicy::Inline);
        assert_eq!(KeyPolicy::from_key("@elements"), KeyPolicy::Detach);
        assert_eq!(KeyPolicy::from_key("@(250)vertices"), KeyPolicy::Chunk(Some(250)));
        assert_eq!(KeyPolicy::from_key("@()faces"), KeyPolicy::Chunk(None));
        assert_eq!(KeyPolicy::from_key("@(0)faces"), KeyPolicy::Chunk(None));
        assert_eq!(KeyPolicy::from_key("@(oops"), KeyPolicy::Detach);
    }

    #[test]
    fn explicit_policy_overrides_name() {
        let mut node = Node::base();
        node.insert_detached("child", Node::base());
        node.insert("@inlined", 1);
        node.set_policy("@inlined", KeyPolicy::Inline);
        assert_eq!(node.policy("child"), KeyPolicy::Detach);
        assert_eq!(node.policy("@inlined"), KeyPolicy::Inline);
    }

    #[test]
    fn reserved_keys_are_ignored() {
        let mut node = Node::base();
        assert!(node.insert("id", "nope").is_none());
        assert!(node.insert("type", "nope").is_none());
        assert!(node.is_empty());
    }

    #[test]
    fn reserved_type_tags_are_rejected() {
        assert_eq!(
            Node::try_new(CHUNK_TYPE).unwrap_err(),
            NodeError::ReservedType("chunk".to_string())
        );
        assert!(Node::try_new(REFERENCE_TYPE).is_err());
        assert!(Node::try_new("Chunk").is_ok());
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn new_panics_on_reserved_type_tag() {
        let _ = Node::new("reference");
    }

    #[test]
    fn cached_id_is_overwritten() {
        let node = Node::base();
        node.cache_id(Id::from_bytes([1; 32]));
        node.cache_id(Id::from_bytes([2; 32]));
        assert_eq!(node.id(), Some(Id::from_bytes([2; 32])));
    }

    #[test]
    fn mutation_clears_cached_id() {
        let mut node = Node::base().with("a", 1);
        node.cache_id(Id::from_bytes([1; 32]));
        assert!(node.id().is_some());
        node.insert("b", 2);
        assert!(node.id().is_none());
    }

    #[test]
    fn equality_ignores_policies_and_ids() {
        let a = Node::base().with_detached("child", Node::base().with("c", 2));
        let b = Node::base().with("child", Node::base().with("c", 2));
        b.cache_id(Id::from_bytes([9; 32]));
        assert_eq!(a, b);
    }

    #[test]
    fn deep_copy_detaches_handles() {
        let shared = Node::base().with("x", 1).into_ref();
        let root = Node::base().with("child", shared.clone()).into_ref();
        let copy = root.deep_copy();
        assert_eq!(copy, root);

        let copied_child = copy.read().get("child").and_then(Value::as_node).cloned().unwrap();
        assert!(!copied_child.ptr_eq(&shared));
    }
}

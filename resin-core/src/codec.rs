//! CBOR encoding of records.
//!
//! A stored record is a CBOR map sorted by key holding the node's `type`,
//! its properties, the `__closure` table (non-leaf records only) and the
//! record's own `id`. Nested inline nodes are maps with a `type` entry;
//! reference placeholders are `{referencedId, type: "reference"}` maps.

use std::collections::BTreeMap;

use crate::hash::HashPolicy;
use crate::id::{Id, ParseIdError};
use crate::node::{
    CLOSURE_KEY, ID_KEY, Node, NodeRef, REFERENCE_TYPE, REFERENCED_ID_KEY, TYPE_KEY, Value,
};

/// Error decoding a stored record.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid CBOR: {0}")]
    Cbor(String),
    #[error("expected a map")]
    NotAMap,
    #[error("map keys must be text")]
    NonTextKey,
    #[error("map has no type tag")]
    MissingType,
    #[error("reference placeholder has no referencedId")]
    MissingReference,
    #[error("integer does not fit in 64 bits")]
    IntegerRange,
    #[error("unsupported CBOR item: {0}")]
    Unsupported(&'static str),
    #[error("invalid closure table")]
    InvalidClosure,
    #[error(transparent)]
    Id(#[from] ParseIdError),
}

/// Serializes a CBOR value to bytes.
pub(crate) fn to_cbor(value: &ciborium::Value) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).expect("serialization should not fail");
    buf
}

/// Builds a CBOR map from fields in key order.
pub(crate) fn fields_to_map(fields: BTreeMap<String, ciborium::Value>) -> ciborium::Value {
    ciborium::Value::Map(
        fields
            .into_iter()
            .map(|(key, value)| (ciborium::Value::Text(key), value))
            .collect(),
    )
}

/// Encodes a reference placeholder.
pub(crate) fn placeholder(id: &Id) -> ciborium::Value {
    ciborium::Value::Map(vec![
        (
            ciborium::Value::Text(REFERENCED_ID_KEY.to_string()),
            ciborium::Value::Text(id.to_string()),
        ),
        (
            ciborium::Value::Text(TYPE_KEY.to_string()),
            ciborium::Value::Text(REFERENCE_TYPE.to_string()),
        ),
    ])
}

/// Encodes a scalar value. Returns `None` for lists and nodes.
pub(crate) fn scalar(value: &Value) -> Option<ciborium::Value> {
    Some(match value {
        Value::Null => ciborium::Value::Null,
        Value::Bool(b) => ciborium::Value::Bool(*b),
        Value::Int(i) => ciborium::Value::Integer((*i).into()),
        Value::Float(f) => ciborium::Value::Float(*f),
        Value::Text(s) => ciborium::Value::Text(s.clone()),
        Value::Bytes(b) => ciborium::Value::Bytes(b.clone()),
        Value::Reference(id) => placeholder(id),
        Value::List(_) | Value::Node(_) => return None,
    })
}

/// Encodes a node with everything inlined, dropping ignored keys.
///
/// Edges back into a node that is still being encoded become null.
pub(crate) fn inline_fields(
    node: &NodeRef,
    policy: &HashPolicy,
) -> BTreeMap<String, ciborium::Value> {
    let mut stack = vec![node.addr()];
    inline_fields_inner(node, policy, &mut stack)
}

fn inline_fields_inner(
    node: &NodeRef,
    policy: &HashPolicy,
    stack: &mut Vec<usize>,
) -> BTreeMap<String, ciborium::Value> {
    let node = node.read();
    let mut fields = BTreeMap::new();
    fields.insert(
        TYPE_KEY.to_string(),
        ciborium::Value::Text(node.type_tag().to_string()),
    );
    for (key, value) in node.iter() {
        if policy.is_ignored(key) {
            continue;
        }
        fields.insert(key.clone(), inline_value(value, policy, stack));
    }
    fields
}

fn inline_value(value: &Value, policy: &HashPolicy, stack: &mut Vec<usize>) -> ciborium::Value {
    if let Some(encoded) = scalar(value) {
        return encoded;
    }
    match value {
        Value::List(items) => ciborium::Value::Array(
            items
                .iter()
                .map(|item| inline_value(item, policy, stack))
                .collect(),
        ),
        Value::Node(child) => {
            if stack.contains(&child.addr()) {
                return ciborium::Value::Null;
            }
            stack.push(child.addr());
            let fields = inline_fields_inner(child, policy, stack);
            stack.pop();
            fields_to_map(fields)
        }
        _ => ciborium::Value::Null,
    }
}

/// Serializes a record: its fields, closure table and own id.
pub(crate) fn encode_record(
    mut fields: BTreeMap<String, ciborium::Value>,
    closure: &BTreeMap<Id, u32>,
    id: &Id,
) -> Vec<u8> {
    if !closure.is_empty() {
        let table = closure
            .iter()
            .map(|(child, depth)| {
                (
                    ciborium::Value::Text(child.to_string()),
                    ciborium::Value::Integer((*depth).into()),
                )
            })
            .collect();
        fields.insert(CLOSURE_KEY.to_string(), ciborium::Value::Map(table));
    }
    fields.insert(ID_KEY.to_string(), ciborium::Value::Text(id.to_string()));
    to_cbor(&fields_to_map(fields))
}

/// Parses record bytes into its top-level fields.
pub fn parse_fields(bytes: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, CodecError> {
    let value: ciborium::Value =
        ciborium::from_reader(bytes).map_err(|e| CodecError::Cbor(e.to_string()))?;
    map_entries(value)
}

fn map_entries(value: ciborium::Value) -> Result<BTreeMap<String, ciborium::Value>, CodecError> {
    let ciborium::Value::Map(entries) = value else {
        return Err(CodecError::NotAMap);
    };
    entries
        .into_iter()
        .map(|(key, value)| match key {
            ciborium::Value::Text(key) => Ok((key, value)),
            _ => Err(CodecError::NonTextKey),
        })
        .collect()
}

/// A stored record decoded back into node form.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    /// The id stored inside the record, if present.
    pub id: Option<Id>,
    pub type_tag: String,
    /// Properties; detached children appear as [`Value::Reference`].
    pub props: BTreeMap<String, Value>,
    pub closure: BTreeMap<Id, u32>,
}

impl DecodedRecord {
    /// Ids of every reference placeholder in the record, in key order.
    pub fn references(&self) -> Vec<Id> {
        let mut ids = Vec::new();
        for value in self.props.values() {
            collect_references(value, &mut ids);
        }
        ids
    }
}

fn collect_references(value: &Value, ids: &mut Vec<Id>) {
    match value {
        Value::Reference(id) => ids.push(*id),
        Value::List(items) => items.iter().for_each(|item| collect_references(item, ids)),
        Value::Node(node) => {
            for (_, value) in node.read().iter() {
                collect_references(value, ids);
            }
        }
        _ => {}
    }
}

/// Decodes stored record bytes.
pub fn decode_record(bytes: &[u8]) -> Result<DecodedRecord, CodecError> {
    let mut fields = parse_fields(bytes)?;
    let id = match fields.remove(ID_KEY) {
        Some(ciborium::Value::Text(text)) => Some(text.parse()?),
        _ => None,
    };
    let closure = match fields.remove(CLOSURE_KEY) {
        Some(table) => decode_closure(table)?,
        None => BTreeMap::new(),
    };
    let type_tag = match fields.remove(TYPE_KEY) {
        Some(ciborium::Value::Text(tag)) => tag,
        _ => return Err(CodecError::MissingType),
    };
    let props = fields
        .into_iter()
        .map(|(key, value)| Ok((key, decode_value(value)?)))
        .collect::<Result<_, CodecError>>()?;
    Ok(DecodedRecord {
        id,
        type_tag,
        props,
        closure,
    })
}

/// Reads only the closure table of a stored record.
pub fn decode_closure_of(bytes: &[u8]) -> Result<BTreeMap<Id, u32>, CodecError> {
    let mut fields = parse_fields(bytes)?;
    match fields.remove(CLOSURE_KEY) {
        Some(table) => decode_closure(table),
        None => Ok(BTreeMap::new()),
    }
}

fn decode_closure(table: ciborium::Value) -> Result<BTreeMap<Id, u32>, CodecError> {
    map_entries(table)?
        .into_iter()
        .map(|(child, depth)| {
            let depth = depth
                .as_integer()
                .and_then(|d| u32::try_from(d).ok())
                .ok_or(CodecError::InvalidClosure)?;
            Ok((child.parse()?, depth))
        })
        .collect()
}

fn decode_value(value: ciborium::Value) -> Result<Value, CodecError> {
    Ok(match value {
        ciborium::Value::Null => Value::Null,
        ciborium::Value::Bool(b) => Value::Bool(b),
        ciborium::Value::Integer(i) => {
            Value::Int(i64::try_from(i).map_err(|_| CodecError::IntegerRange)?)
        }
        ciborium::Value::Float(f) => Value::Float(f),
        ciborium::Value::Text(s) => Value::Text(s),
        ciborium::Value::Bytes(b) => Value::Bytes(b),
        ciborium::Value::Array(items) => Value::List(
            items
                .into_iter()
                .map(decode_value)
                .collect::<Result<_, _>>()?,
        ),
        map @ ciborium::Value::Map(_) => {
            let mut fields = map_entries(map)?;
            let type_tag = match fields.remove(TYPE_KEY) {
                Some(ciborium::Value::Text(tag)) => tag,
                _ => return Err(CodecError::MissingType),
            };
            if type_tag == REFERENCE_TYPE {
                return match fields.remove(REFERENCED_ID_KEY) {
                    Some(ciborium::Value::Text(id)) => Ok(Value::Reference(id.parse()?)),
                    _ => Err(CodecError::MissingReference),
                };
            }
            let props = fields
                .into_iter()
                .map(|(key, value)| Ok((key, decode_value(value)?)))
                .collect::<Result<_, CodecError>>()?;
            Value::Node(NodeRef::new(Node::from_parts(type_tag, props)))
        }
        ciborium::Value::Tag(..) => return Err(CodecError::Unsupported("tag")),
        _ => return Err(CodecError::Unsupported("unknown item")),
    })
}

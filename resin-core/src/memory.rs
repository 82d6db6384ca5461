use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::id::Id;
use crate::transport::{Transport, TransportError};

/// An in-memory transport backed by a HashMap.
///
/// Useful for testing and as a reference implementation. Call counters let
/// tests assert how often each operation was issued.
#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    data: RwLock<HashMap<Id, Vec<u8>>>,
    save_calls: AtomicUsize,
    exists_calls: AtomicUsize,
    load_calls: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        MemoryTransport {
            name: name.into(),
            data: RwLock::new(HashMap::new()),
            save_calls: AtomicUsize::new(0),
            exists_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Ids of every stored record, sorted.
    pub fn ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// Returns a stored record without counting a load.
    pub fn get(&self, id: &Id) -> Option<Vec<u8>> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Number of records passed to save or save_many.
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::Relaxed)
    }

    /// Number of exists requests.
    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(Ordering::Relaxed)
    }

    /// Number of records requested through load or load_many.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::Relaxed)
    }

    fn insert(&self, id: Id, content: Vec<u8>) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert(content);
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, id: Id, content: Vec<u8>) -> Result<(), TransportError> {
        self.save_calls.fetch_add(1, Ordering::Relaxed);
        self.insert(id, content);
        Ok(())
    }

    async fn save_many(&self, records: Vec<(Id, Vec<u8>)>) -> Result<(), TransportError> {
        self.save_calls.fetch_add(records.len(), Ordering::Relaxed);
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        for (id, content) in records {
            data.entry(id).or_insert(content);
        }
        Ok(())
    }

    async fn exists(&self, ids: &[Id]) -> Result<HashSet<Id>, TransportError> {
        self.exists_calls.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ids.iter().filter(|id| data.contains_key(id)).copied().collect())
    }

    async fn load(&self, id: &Id) -> Result<Vec<u8>, TransportError> {
        self.load_calls.fetch_add(1, Ordering::Relaxed);
        self.get(id).ok_or_else(|| TransportError::NotFound {
            transport: self.name.clone(),
            id: *id,
        })
    }

    async fn load_many(&self, ids: &[Id]) -> Result<Vec<(Id, Vec<u8>)>, TransportError> {
        self.load_calls.fetch_add(ids.len(), Ordering::Relaxed);
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ids
            .iter()
            .filter_map(|id| data.get(id).map(|content| (*id, content.clone())))
            .collect())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Point-in-time copy of every progress counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Records handled so far, per label (usually a transport name).
    pub counters: BTreeMap<String, u64>,
    /// Total record count, once known.
    pub total: Option<u64>,
}

impl ProgressSnapshot {
    pub fn get(&self, label: &str) -> u64 {
        self.counters.get(label).copied().unwrap_or(0)
    }
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Monotonic per-label counters with an optional observer.
///
/// The callback runs on whichever task advanced the counter, outside the
/// tracker's lock.
#[derive(Default)]
pub struct ProgressTracker {
    state: Mutex<ProgressSnapshot>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: impl Fn(&ProgressSnapshot) + Send + Sync + 'static) -> Self {
        ProgressTracker {
            state: Mutex::new(ProgressSnapshot::default()),
            callback: Some(Arc::new(callback)),
        }
    }

    /// Publishes the known total.
    pub fn set_total(&self, total: u64) {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.total = Some(total);
            state.clone()
        };
        self.notify(&snapshot);
    }

    /// Adds `count` to the counter for `label` and notifies the observer.
    pub fn advance(&self, label: &str, count: u64) {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            *state.counters.entry(label.to_string()).or_insert(0) += count;
            state.clone()
        };
        self.notify(&snapshot);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify(&self, snapshot: &ProgressSnapshot) {
        if let Some(callback) = &self.callback {
            callback(snapshot);
        }
    }
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("state", &self.snapshot())
            .finish_non_exhaustive()
    }
}

//! In-flight counters.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::key::LimitKey;

/// A live count of in-flight requests or bytes for one limit key.
///
/// Updates are lock-free. The value only moves through paired
/// [`add`](Self::add)/[`sub`](Self::sub) calls, so it returns to zero once
/// every request touching it has finished.
#[derive(Debug, Default)]
pub struct InflightCounter {
    value: AtomicU64,
}

impl InflightCounter {
    /// A counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value.
    pub fn load(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Add `amount` and return the new value.
    pub fn add(&self, amount: u64) -> u64 {
        self.value.fetch_add(amount, Ordering::SeqCst).wrapping_add(amount)
    }

    /// Add `amount` unless the sum would overflow. Returns the new value, or
    /// `None` with the counter unchanged.
    pub fn try_add(&self, amount: u64) -> Option<u64> {
        self.value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(amount))
            .ok()
            .map(|prev| prev + amount)
    }

    /// Subtract `amount` and return the new value.
    pub fn sub(&self, amount: u64) -> u64 {
        self.value.fetch_sub(amount, Ordering::SeqCst).wrapping_sub(amount)
    }
}

/// Counters keyed by limit key, created on first use and never removed.
///
/// The store is independent of the limit table: reloading thresholds does not
/// reset in-flight counts.
#[derive(Debug, Default)]
pub struct CounterStore {
    /// Only the install path takes the write lock.
    slots: RwLock<HashMap<LimitKey, Arc<InflightCounter>>>,
}

impl CounterStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the counter for `key`, installing a zeroed one on first use.
    ///
    /// Concurrent first use of the same key installs exactly one counter.
    pub fn get_or_create(&self, key: &LimitKey) -> Arc<InflightCounter> {
        if let Some(counter) = self.slots.read().get(key) {
            return Arc::clone(counter);
        }

        let mut slots = self.slots.write();
        let counter = slots.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "Creating in-flight counter");
            Arc::new(InflightCounter::new())
        });
        Arc::clone(counter)
    }

    /// Current value for `key`, or `None` if it was never used.
    pub fn value(&self, key: &LimitKey) -> Option<u64> {
        self.slots.read().get(key).map(|c| c.load())
    }

    /// Number of installed counters.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether no counter has been installed yet.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

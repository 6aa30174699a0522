//! Scoped release of held increments.

use std::fmt;
use std::sync::Arc;

use super::counter::InflightCounter;
use super::key::LimitKey;

/// One increment held against a counter. Dropping the guard undoes exactly
/// that increment.
pub struct CounterGuard {
    key: LimitKey,
    counter: Arc<InflightCounter>,
    amount: u64,
}

impl CounterGuard {
    /// Apply `amount` to `counter` and return the guard that undoes it.
    ///
    /// Returns `None`, leaving the counter untouched, if the increment would
    /// overflow.
    pub(crate) fn try_acquire(
        key: LimitKey,
        counter: Arc<InflightCounter>,
        amount: u64,
    ) -> Option<Self> {
        counter.try_add(amount)?;
        Some(Self {
            key,
            counter,
            amount,
        })
    }

    /// The key this increment is held against.
    pub fn key(&self) -> &LimitKey {
        &self.key
    }

    /// Size of the held increment.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Value of the guarded counter, including this guard's increment.
    pub fn current(&self) -> u64 {
        self.counter.load()
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.counter.sub(self.amount);
    }
}

impl fmt::Debug for CounterGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterGuard")
            .field("key", &self.key)
            .field("amount", &self.amount)
            .finish()
    }
}

/// The increments a request holds while it is in flight.
///
/// Released when dropped, so every exit path of the enclosing scope
/// (completion, early return, cancellation, unwinding) gives the capacity
/// back.
#[derive(Debug, Default)]
#[must_use = "dropping an Admission releases its held capacity immediately"]
pub struct Admission {
    guards: Vec<CounterGuard>,
}

impl Admission {
    /// An admission holding nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn hold(&mut self, guard: CounterGuard) {
        self.guards.push(guard);
    }

    /// Keys this admission holds increments against, in check order.
    pub fn held_keys(&self) -> impl Iterator<Item = &LimitKey> {
        self.guards.iter().map(CounterGuard::key)
    }

    /// Number of held increments.
    pub fn held(&self) -> usize {
        self.guards.len()
    }

    /// Release everything now.
    pub fn release(self) {
        drop(self);
    }
}

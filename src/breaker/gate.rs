//! The circuit breaker service and its admission check.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::counter::CounterStore;
#[cfg(test)]
use super::counter::InflightCounter;
use super::guard::{Admission, CounterGuard};
use super::key::{LimitKey, Metric, Scope};
use super::limits::LimitTable;
use super::rules::BreakerConfig;
use crate::error::Result;

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A count limit is full
    TooManyRequests,
    /// A bytes limit is full
    RequestBytesExceeded,
}

impl ErrorCode {
    fn for_metric(metric: Metric) -> Self {
        match metric {
            Metric::Count => ErrorCode::TooManyRequests,
            Metric::Bytes => ErrorCode::RequestBytesExceeded,
        }
    }

    /// S3 error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCode::TooManyRequests => "ErrTooManyRequest",
            ErrorCode::RequestBytesExceeded => "ErrRequestBytesExceed",
        }
    }

    /// Human readable message for the error body.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::TooManyRequests => "Too many simultaneous requests",
            ErrorCode::RequestBytesExceeded => "Simultaneous request bytes exceed limitations",
        }
    }

    /// HTTP status sent with the rejection.
    pub fn status(&self) -> http::StatusCode {
        http::StatusCode::TOO_MANY_REQUESTS
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Per-action admission control over in-flight requests and bytes.
///
/// One instance is built at startup and shared (behind an `Arc`) by every
/// request handler. Thresholds come from the current [`LimitTable`]
/// generation; live counts come from the [`CounterStore`], which outlives any
/// number of reloads.
///
/// The bound is soft. Each check reads the counter, increments it if there
/// appears to be room, then re-reads it. Requests racing through the first
/// read can briefly push a counter above its threshold; the re-read rejects
/// them, and their increments are returned when the request finishes. Requests
/// that were admitted never hold more than the threshold between them.
pub struct CircuitBreaker {
    table: RwLock<Arc<LimitTable>>,
    counters: CounterStore,
    /// Serializes reloads so generations are numbered in publish order.
    reload: Mutex<()>,
    /// Runs between a check's first read and its increment.
    #[cfg(test)]
    after_precheck: Mutex<Option<Box<dyn Fn(&InflightCounter) + Send + Sync>>>,
}

impl CircuitBreaker {
    /// A breaker with no limits. It admits everything until a load succeeds.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(LimitTable::disabled())),
            counters: CounterStore::new(),
            reload: Mutex::new(()),
            #[cfg(test)]
            after_precheck: Mutex::new(None),
        }
    }

    /// Build a breaker from an already decoded document.
    pub fn with_config(config: &BreakerConfig) -> Result<Self> {
        let breaker = Self::new();
        breaker.load_config(config)?;
        Ok(breaker)
    }

    /// Decode raw bytes and, on success, publish a new generation.
    ///
    /// On failure the current generation is kept and the error is returned
    /// for the caller to log.
    pub fn load_from_bytes(&self, bytes: &[u8]) -> Result<()> {
        let config = BreakerConfig::from_bytes(bytes).map_err(|e| {
            warn!(error = %e, "Rejected circuit breaker configuration");
            e
        })?;
        self.load_config(&config)
    }

    /// Build a table from `config` and swap it in.
    pub fn load_config(&self, config: &BreakerConfig) -> Result<()> {
        let _reload = self.reload.lock();
        let generation = self.table.read().generation() + 1;
        let table = LimitTable::build(config, generation)?;

        info!(
            generation,
            enabled = table.is_enabled(),
            limits = table.len(),
            "Circuit breaker configuration loaded"
        );

        *self.table.write() = Arc::new(table);
        Ok(())
    }

    /// The current generation.
    pub fn limits(&self) -> Arc<LimitTable> {
        Arc::clone(&self.table.read())
    }

    /// Whether enforcement is on. When off, nothing is ever rejected, bucket
    /// limits included.
    pub fn is_enabled(&self) -> bool {
        self.table.read().is_enabled()
    }

    /// Number of the current limit table generation; 0 before any load.
    pub fn generation(&self) -> u64 {
        self.table.read().generation()
    }

    /// Threshold for `key` in the current generation.
    pub fn threshold(&self, key: &LimitKey) -> Option<u64> {
        self.table.read().threshold(key)
    }

    /// Live value of a counter, or `None` if the key was never checked.
    pub fn counter_value(&self, key: &LimitKey) -> Option<u64> {
        self.counters.value(key)
    }

    /// Number of counters created so far.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Decide whether a request may proceed.
    ///
    /// Checks run in this order and stop at the first rejection: bucket
    /// count, bucket bytes, global count, global bytes. Bucket checks are
    /// skipped when `bucket` is `None`.
    ///
    /// On success the returned [`Admission`] holds every increment and must
    /// be kept alive until the request is done. On rejection any increments
    /// taken by earlier checks are released before this returns.
    pub fn admit(
        &self,
        bucket: Option<&str>,
        action: &str,
        content_length: u64,
    ) -> std::result::Result<Admission, ErrorCode> {
        let table = self.limits();
        let mut admission = Admission::empty();

        if !table.is_enabled() {
            return Ok(admission);
        }

        if let Some(bucket) = bucket {
            let scope = Scope::bucket(bucket);
            self.check(&table, &mut admission, scope.clone(), action, Metric::Count, 1)?;
            self.check(&table, &mut admission, scope, action, Metric::Bytes, content_length)?;
        }
        self.check(&table, &mut admission, Scope::Global, action, Metric::Count, 1)?;
        self.check(&table, &mut admission, Scope::Global, action, Metric::Bytes, content_length)?;

        Ok(admission)
    }

    fn check(
        &self,
        table: &LimitTable,
        admission: &mut Admission,
        scope: Scope,
        action: &str,
        metric: Metric,
        inc: u64,
    ) -> std::result::Result<(), ErrorCode> {
        let key = LimitKey::new(scope, action, metric);
        let Some(max) = table.threshold(&key) else {
            return Ok(());
        };

        let counter = self.counters.get_or_create(&key);
        let current = counter.load();

        trace!(key = %key, current, inc, max, "Checking limit");

        if current.checked_add(inc).map_or(true, |total| total > max) {
            debug!(key = %key, current, inc, max, "Limit exceeded");
            return Err(ErrorCode::for_metric(metric));
        }

        #[cfg(test)]
        {
            if let Some(hook) = self.after_precheck.lock().as_ref() {
                hook(&*counter);
            }
        }

        let Some(guard) = CounterGuard::try_acquire(key.clone(), counter, inc) else {
            debug!(key = %key, inc, max, "Counter would overflow");
            return Err(ErrorCode::for_metric(metric));
        };
        let after = guard.current();
        let over = after > max;
        if over {
            debug!(key = %guard.key(), after, max, "Limit exceeded after increment");
        }
        admission.hold(guard);

        if over {
            return Err(ErrorCode::for_metric(metric));
        }
        Ok(())
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.limits();
        f.debug_struct("CircuitBreaker")
            .field("enabled", &table.is_enabled())
            .field("generation", &table.generation())
            .field("limits", &table.len())
            .field("counters", &self.counters.len())
            .finish()
    }
}

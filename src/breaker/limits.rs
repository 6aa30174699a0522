//! Limit table construction.

use std::collections::HashMap;

use super::key::{LimitKey, Scope};
use super::rules::BreakerConfig;
use crate::error::Result;

/// One immutable generation of thresholds plus the global enabled flag.
///
/// A table is never mutated after construction; reloads build a new one and
/// swap it in whole.
#[derive(Debug, Clone, Default)]
pub struct LimitTable {
    enabled: bool,
    generation: u64,
    limits: HashMap<LimitKey, u64>,
}

impl LimitTable {
    /// An empty, disabled table. This is the state before any load succeeds.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build a table from a decoded document.
    ///
    /// Global entries are included (and enforcement switched on) only when the
    /// global section is enabled and non-empty. Bucket entries are included
    /// whenever their own bucket is enabled, regardless of the global flag.
    pub fn build(config: &BreakerConfig, generation: u64) -> Result<Self> {
        let mut enabled = false;
        let mut limits = HashMap::new();

        if let Some(global) = &config.global {
            if global.enabled && !global.actions.is_empty() {
                enabled = true;
                for (spec, limit) in global.parsed_actions()? {
                    limits.insert(LimitKey::new(Scope::Global, &spec.action, spec.metric), limit);
                }
            }
        }

        for (bucket, options) in &config.buckets {
            if !options.enabled {
                continue;
            }
            for (spec, limit) in options.parsed_actions()? {
                limits.insert(
                    LimitKey::new(Scope::bucket(bucket.as_str()), &spec.action, spec.metric),
                    limit,
                );
            }
        }

        Ok(Self {
            enabled,
            generation,
            limits,
        })
    }

    /// Whether limits are enforced at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Load counter this table was built for; 0 for the initial table.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The threshold for a key; `None` means unbounded.
    pub fn threshold(&self, key: &LimitKey) -> Option<u64> {
        self.limits.get(key).copied()
    }

    /// Number of configured thresholds.
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// Whether no threshold is configured.
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Entries sorted by their display form.
    pub fn entries(&self) -> Vec<(&LimitKey, u64)> {
        let mut entries: Vec<_> = self.limits.iter().map(|(k, v)| (k, *v)).collect();
        entries.sort_by_key(|(k, _)| k.to_string());
        entries
    }
}

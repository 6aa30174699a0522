//! Limit key generation and handling.

use std::fmt;
use std::str::FromStr;

use crate::error::GateError;

/// Object read operations.
pub const ACTION_READ: &str = "Read";
/// Object write operations.
pub const ACTION_WRITE: &str = "Write";
/// Bucket and object listings.
pub const ACTION_LIST: &str = "List";
/// Object tagging operations.
pub const ACTION_TAGGING: &str = "Tagging";
/// Bucket administration.
pub const ACTION_ADMIN: &str = "Admin";

/// Where a limit applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Across all buckets
    Global,
    /// A single named bucket
    Bucket(String),
}

impl Scope {
    /// Scope of a single named bucket.
    pub fn bucket(name: impl Into<String>) -> Self {
        Scope::Bucket(name.into())
    }
}

/// What a limit measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Simultaneous in-flight requests
    Count,
    /// Cumulative in-flight declared content length
    Bytes,
}

impl Metric {
    /// Name used in action specs and key display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Count => "count",
            Metric::Bytes => "bytes",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "count" => Ok(Metric::Count),
            "bytes" => Ok(Metric::Bytes),
            other => Err(GateError::InvalidAction(other.to_string())),
        }
    }
}

/// An action name paired with the metric it is limited on.
///
/// In configuration documents this is written as `Write`, `Write:count` or
/// `Write:bytes`; a bare action name means `count`. Only a trailing `:count`
/// or `:bytes` is read as a metric, so names like `s3:PutObject` are kept
/// whole.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionSpec {
    pub action: String,
    pub metric: Metric,
}

impl FromStr for ActionSpec {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (action, metric) = match s.rsplit_once(':') {
            Some((action, suffix)) => match suffix.parse::<Metric>() {
                Ok(metric) => (action, metric),
                Err(_) => (s, Metric::Count),
            },
            None => (s, Metric::Count),
        };

        if action.is_empty() {
            return Err(GateError::InvalidAction(s.to_string()));
        }

        Ok(Self {
            action: action.to_string(),
            metric,
        })
    }
}

/// A key that uniquely identifies one threshold and one counter.
///
/// Scope is part of the key, so bucket and global entries for the same
/// action never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    pub scope: Scope,
    pub action: String,
    pub metric: Metric,
}

impl LimitKey {
    /// Key for `action` measured by `metric` within `scope`.
    pub fn new(scope: Scope, action: &str, metric: Metric) -> Self {
        Self {
            scope,
            action: action.to_string(),
            metric,
        }
    }

    /// Key in the global scope.
    pub fn global(action: &str, metric: Metric) -> Self {
        Self::new(Scope::Global, action, metric)
    }

    /// Key scoped to one bucket.
    pub fn bucket(bucket: &str, action: &str, metric: Metric) -> Self {
        Self::new(Scope::bucket(bucket), action, metric)
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bucket = match &self.scope {
            Scope::Global => "",
            Scope::Bucket(name) => name.as_str(),
        };
        write!(f, "{}:{}:{}", bucket, self.action, self.metric)
    }
}

//! Admission control state: limits, counters and the gate itself.

mod counter;
mod gate;
mod guard;
mod key;
mod limits;
mod rules;
mod store;

pub use counter::{CounterStore, InflightCounter};
pub use gate::{CircuitBreaker, ErrorCode};
pub use guard::{Admission, CounterGuard};
pub use key::{
    ActionSpec, LimitKey, Metric, Scope, ACTION_ADMIN, ACTION_LIST, ACTION_READ, ACTION_TAGGING,
    ACTION_WRITE,
};
pub use limits::LimitTable;
pub use rules::{ActionLimits, BreakerConfig};
pub use store::{spawn_reload_task, ConfigStore, FileConfigStore, MemoryConfigStore};

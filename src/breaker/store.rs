//! Config store access and the breaker's initialization phase.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::gate::CircuitBreaker;
use crate::error::{GateError, Result};

/// Source of the raw circuit breaker document.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the current document bytes.
    async fn read_config(&self) -> Result<Vec<u8>>;

    /// Human readable location, for logs.
    fn describe(&self) -> String;
}

/// Reads the document from a file on disk.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    /// A store reading from `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The file this store reads.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn read_config(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path).await.map_err(|e| {
            GateError::Store(format!("read {}: {}", self.path.display(), e))
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Holds the document in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    contents: RwLock<Option<Vec<u8>>>,
}

impl MemoryConfigStore {
    /// An empty store; reads fail until something is put.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store already holding `contents`.
    pub fn with_contents(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            contents: RwLock::new(Some(contents.into())),
        }
    }

    /// Replace the stored document.
    pub fn put(&self, contents: impl Into<Vec<u8>>) {
        *self.contents.write() = Some(contents.into());
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn read_config(&self) -> Result<Vec<u8>> {
        self.contents
            .read()
            .clone()
            .ok_or_else(|| GateError::Store("no circuit breaker config stored".to_string()))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl CircuitBreaker {
    /// Build a breaker from a single read of `store`.
    ///
    /// A failed read or decode is logged and yields a disabled breaker, so a
    /// missing or broken document never blocks traffic.
    pub async fn initialize(store: &dyn ConfigStore) -> Self {
        let breaker = Self::new();
        if let Err(e) = breaker.reload_from(store).await {
            warn!(
                store = %store.describe(),
                error = %e,
                "Failed to load circuit breaker config, admission control disabled"
            );
        }
        breaker
    }

    /// Read `store` and publish the result. The current generation is kept
    /// on any failure.
    pub async fn reload_from(&self, store: &dyn ConfigStore) -> Result<()> {
        let bytes = store.read_config().await?;
        debug!(store = %store.describe(), bytes = bytes.len(), "Read circuit breaker config");
        self.load_from_bytes(&bytes)
    }
}

/// Periodically re-read `store` into `breaker`.
///
/// Failures are logged and leave the previous generation in place. The task
/// runs until aborted.
pub fn spawn_reload_task(
    breaker: Arc<CircuitBreaker>,
    store: Arc<dyn ConfigStore>,
    interval: Duration,
) -> JoinHandle<()> {
    info!(
        store = %store.describe(),
        interval_secs = interval.as_secs(),
        "Starting circuit breaker reload task"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately and the initial load already ran.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = breaker.reload_from(store.as_ref()).await {
                warn!(
                    store = %store.describe(),
                    error = %e,
                    "Circuit breaker reload failed, keeping previous configuration"
                );
            }
        }
    })
}

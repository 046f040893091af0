//! Key registry (C6, ambient): lazily creates and caches one
//! [`Executor`] per command key.
//!
//! Grounded directly in the teacher's `ModelRegistry` /
//! `resolve_and_load_internal` in `runtime.rs`: a `RwLock` fast path for the
//! common case of an already-created executor, and a `Mutex`-guarded map of
//! per-key creation locks for the slow path, so two racing submissions for
//! a brand new key create exactly one executor rather than two.

use crate::config::DefenderConfig;
use crate::executor::Executor;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Owns every live [`Executor`] for a process, keyed by command key, and the
/// [`DefenderConfig`] used to configure new ones as they're created.
pub struct KeyRegistry<T> {
    config: DefenderConfig,
    executors: RwLock<HashMap<String, Arc<Executor<T>>>>,
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<T> KeyRegistry<T>
where
    T: Send + Sync + Clone + 'static,
{
    pub fn new(config: DefenderConfig) -> Self {
        Self {
            config,
            executors: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return the executor for `key`, creating and caching it on first use.
    /// Concurrent first-time callers for the same key are serialized onto a
    /// single creation; all but the winner observe the cached result.
    pub async fn get_or_create(&self, key: &str) -> Arc<Executor<T>> {
        if let Some(executor) = self.executors.read().await.get(key) {
            return executor.clone();
        }

        let lock = {
            let mut locks = self.creation_locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if let Some(executor) = self.executors.read().await.get(key) {
            let mut locks = self.creation_locks.lock().await;
            locks.remove(key);
            return executor.clone();
        }

        let cfg = self.config.for_key(key);
        let executor = Executor::spawn(key.to_string(), cfg);
        self.executors
            .write()
            .await
            .insert(key.to_string(), executor.clone());

        let mut locks = self.creation_locks.lock().await;
        locks.remove(key);
        executor
    }

    /// Number of executors created so far, for diagnostics and tests.
    pub async fn len(&self) -> usize {
        self.executors.read().await.len()
    }
}

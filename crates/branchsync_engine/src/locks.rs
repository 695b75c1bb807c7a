//! In-flight mutation locks.

use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tracks which aggregate keys currently have a mutation in flight.
///
/// A second mutation for a held key fails fast with
/// [`EngineError::DuplicateInFlight`] instead of queueing; offline
/// clients retry the whole save, so queueing would only multiply
/// duplicates. An optional TTL evicts locks orphaned by a crashed
/// caller.
#[derive(Clone)]
pub struct InFlightLocks {
    inner: Arc<Mutex<HashMap<String, Instant>>>,
    ttl: Option<Duration>,
}

impl Default for InFlightLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightLocks {
    /// Creates a lock table without expiry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl: None,
        }
    }

    /// Creates a lock table whose entries expire after `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl: Some(ttl),
        }
    }

    /// Attempts to acquire the lock for a key.
    ///
    /// The returned guard releases the lock on drop, including on the
    /// error paths of the caller.
    pub fn try_acquire(&self, key: impl Into<String>) -> EngineResult<InFlightGuard> {
        let key = key.into();
        let mut held = self.inner.lock();
        if let Some(acquired_at) = held.get(&key) {
            let expired = self
                .ttl
                .is_some_and(|ttl| acquired_at.elapsed() > ttl);
            if !expired {
                return Err(EngineError::DuplicateInFlight { key });
            }
            tracing::warn!(key, "evicting expired in-flight lock");
        }
        held.insert(key.clone(), Instant::now());
        Ok(InFlightGuard {
            locks: Arc::clone(&self.inner),
            key,
        })
    }

    /// Returns true if the key currently holds a live lock.
    pub fn is_held(&self, key: &str) -> bool {
        let held = self.inner.lock();
        match held.get(key) {
            Some(acquired_at) => !self
                .ttl
                .is_some_and(|ttl| acquired_at.elapsed() > ttl),
            None => false,
        }
    }
}

/// RAII guard for one in-flight key.
#[derive(Debug)]
pub struct InFlightGuard {
    locks: Arc<Mutex<HashMap<String, Instant>>>,
    key: String,
}

impl InFlightGuard {
    /// The key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.key);
    }
}

//! Conversion lock manager
//!
//! Process-wide registry of in-flight conversions keyed by artifact path.
//! The first caller for a key becomes the owner; later callers wait for the
//! owner to finish and then re-check the metadata store.
//!
//! Locking is best-effort. Every entry carries a TTL, so an owner that dies
//! mid-conversion frees its key once the TTL passes instead of blocking it
//! forever. The worst outcome of an early expiry is one duplicate encode.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ConvertError;

/// Time source for lock expiry
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    expires_at: Instant,
    token: u64,
}

/// TTL lock map
pub struct ConversionLocks {
    entries: Mutex<HashMap<String, LockEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    next_token: AtomicU64,
}

impl ConversionLocks {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
            next_token: AtomicU64::new(1),
        }
    }

    /// Become the owner of `key` if nobody holds a live entry for it
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Option<LockGuard> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return None;
            }
            tracing::debug!(key = %key, "Reclaiming expired conversion lock");
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key.to_string(),
            LockEntry {
                expires_at: now + self.ttl,
                token,
            },
        );

        Some(LockGuard {
            key: key.to_string(),
            token,
            locks: Arc::clone(self),
        })
    }

    /// Whether a live entry exists; expired entries are dropped on the way
    pub fn is_locked(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Drop the entry for `key` regardless of owner
    pub fn release(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn release_owned(&self, key: &str, token: u64) {
        let mut entries = self.entries.lock();
        // A guard outliving its TTL must not free a newer owner's entry
        if entries.get(key).map(|e| e.token) == Some(token) {
            entries.remove(key);
        }
    }

    /// Wait until `key` is free, polling every `poll`
    pub async fn wait_for_release(
        &self,
        key: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<(), ConvertError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_locked(key) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConvertError::LockTimeout(key.to_string()));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Remove every expired entry; returns how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodic sweep in the background
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let locks = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let swept = locks.sweep_expired();
                if swept > 0 {
                    tracing::debug!(swept, "Swept expired conversion locks");
                }
            }
        })
    }
}

/// Ownership of one key; released on drop
pub struct LockGuard {
    key: String,
    token: u64,
    locks: Arc<ConversionLocks>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locks.release_owned(&self.key, self.token);
    }
}

//! Named advisory locks for cross-worker coordination.
//!
//! Acquisition atomicity comes from the store's conditional upsert: two
//! workers racing for an unheld or expired lock both issue the upsert, and
//! exactly one observes itself as the resulting holder. TTL expiry is what
//! recovers locks from crashed holders.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use chronos_core::WorkerId;
use chronos_store::{LockStore, StoreResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of a scoped lock acquisition.
#[derive(Debug)]
pub enum WithLock<T> {
    /// Another worker holds the lock.
    NotAcquired,
    Completed(T),
}

impl<T> WithLock<T> {
    pub fn acquired(&self) -> bool {
        matches!(self, WithLock::Completed(_))
    }
}

/// Per-worker view over the shared lock collection.
///
/// Tracks which lock ids this worker believes it holds so `release_all` can
/// clean up on shutdown.
pub struct LockManager {
    store: Arc<dyn LockStore>,
    worker_id: WorkerId,
    held: Mutex<HashSet<String>>,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, worker_id: WorkerId) -> Self {
        Self {
            store,
            worker_id,
            held: Mutex::new(HashSet::new()),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Try to take (or renew) the lock. Returns whether this worker holds
    /// it afterwards.
    pub async fn acquire(&self, lock_id: &str, ttl_ms: i64) -> StoreResult<bool> {
        let lock = self
            .store
            .upsert_lock(lock_id, &self.worker_id, ttl_ms, Utc::now())
            .await?;
        let won = lock.holder == self.worker_id;
        if won {
            self.track(lock_id);
            debug!(lock_id, holder = %self.worker_id, "lock acquired");
        }
        Ok(won)
    }

    /// Release if held by this worker.
    pub async fn release(&self, lock_id: &str) -> StoreResult<bool> {
        self.forget(lock_id);
        self.store.delete_lock(lock_id, &self.worker_id).await
    }

    /// Extend the TTL, gated on still being the holder.
    pub async fn renew(&self, lock_id: &str, ttl_ms: i64) -> StoreResult<bool> {
        let renewed = self
            .store
            .renew_lock(lock_id, &self.worker_id, ttl_ms, Utc::now())
            .await?;
        if !renewed {
            self.forget(lock_id);
        }
        Ok(renewed)
    }

    pub async fn is_held_by_me(&self, lock_id: &str) -> StoreResult<bool> {
        let now = Utc::now();
        Ok(self
            .store
            .get_lock(lock_id)
            .await?
            .is_some_and(|l| l.holder == self.worker_id && !l.is_expired(now)))
    }

    /// Release every lock this worker tracks. Used on shutdown.
    pub async fn release_all(&self) -> StoreResult<u64> {
        let held: Vec<String> = {
            let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
            held.drain().collect()
        };
        let mut released = 0;
        for lock_id in held {
            if self.store.delete_lock(&lock_id, &self.worker_id).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Run `f` under the lock, releasing on the way out. When the lock is
    /// contended the closure never runs.
    pub async fn with_lock<F, Fut, T>(
        &self,
        lock_id: &str,
        ttl_ms: i64,
        f: F,
    ) -> StoreResult<WithLock<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire(lock_id, ttl_ms).await? {
            return Ok(WithLock::NotAcquired);
        }
        let result = f().await;
        if let Err(e) = self.release(lock_id).await {
            warn!(lock_id, error = %e, "failed to release lock after scoped use");
        }
        Ok(WithLock::Completed(result))
    }

    /// Acquire and keep renewing in the background until the guard is
    /// released or dropped. Returns `None` when the lock is contended.
    ///
    /// If a renewal is refused (the lock was lost), the renewal task stops
    /// and the lock is forgotten.
    pub async fn acquire_with_renewal(
        self: &Arc<Self>,
        lock_id: &str,
        ttl_ms: i64,
        renew_every: Option<Duration>,
    ) -> StoreResult<Option<RenewalGuard>> {
        if !self.acquire(lock_id, ttl_ms).await? {
            return Ok(None);
        }

        let renew_every =
            renew_every.unwrap_or_else(|| Duration::from_millis((ttl_ms.max(2) / 2) as u64));
        let token = CancellationToken::new();
        let renewal_token = token.clone();
        let manager = Arc::clone(self);
        let id = lock_id.to_string();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(renew_every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = renewal_token.cancelled() => break,
                    _ = tick.tick() => match manager.renew(&id, ttl_ms).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(lock_id = %id, "lock lost, stopping renewal");
                            break;
                        }
                        Err(e) => {
                            warn!(lock_id = %id, error = %e, "lock renewal failed");
                        }
                    },
                }
            }
        });

        Ok(Some(RenewalGuard {
            manager: Arc::clone(self),
            lock_id: lock_id.to_string(),
            token,
        }))
    }

    fn track(&self, lock_id: &str) {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(lock_id.to_string());
    }

    fn forget(&self, lock_id: &str) {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(lock_id);
    }
}

/// Handle for a lock kept alive by background renewal.
///
/// Dropping the guard stops renewal and lets the TTL reclaim the lock;
/// call [`release`](RenewalGuard::release) for an immediate release.
pub struct RenewalGuard {
    manager: Arc<LockManager>,
    lock_id: String,
    token: CancellationToken,
}

impl RenewalGuard {
    pub async fn release(self) -> StoreResult<bool> {
        self.token.cancel();
        self.manager.release(&self.lock_id).await
    }
}

impl Drop for RenewalGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

//! Processing lease.
//!
//! Only one processing run may be active per lease name, across threads and
//! processes sharing the database. The lease expires on its own after its TTL
//! so a crashed holder cannot block the queue forever.

use super::error::QueueResult;
use super::events::QueueEvent;
use super::models::Lease;
use super::queue::JobQueue;
use super::store::JobStore;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Holds one named lease on behalf of this process.
pub struct LockManager {
    store: Arc<dyn JobStore>,
    name: String,
    holder: String,
    ttl_secs: i64,
}

impl LockManager {
    /// Each manager gets its own random holder id.
    pub fn new(store: Arc<dyn JobStore>, name: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            store,
            name: name.into(),
            holder: Uuid::new_v4().to_string(),
            ttl_secs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Take the lease. Returns false while any live lease exists, including
    /// one held by this manager.
    pub fn lock(&self) -> QueueResult<bool> {
        Ok(self
            .store
            .try_acquire_lease(&self.name, &self.holder, self.ttl_secs)?)
    }

    /// Push the expiry of our live lease one TTL into the future.
    pub fn renew(&self) -> QueueResult<bool> {
        Ok(self
            .store
            .renew_lease(&self.name, &self.holder, self.ttl_secs)?)
    }

    /// Release the lease if we hold it.
    pub fn unlock(&self) -> QueueResult<bool> {
        Ok(self.store.release_lease(&self.name, Some(&self.holder))?)
    }

    /// Release the lease whoever holds it.
    pub fn force_unlock(&self) -> QueueResult<bool> {
        Ok(self.store.release_lease(&self.name, None)?)
    }

    pub fn lease(&self) -> QueueResult<Option<Lease>> {
        Ok(self.store.get_lease(&self.name)?)
    }

    /// True while a live lease exists, held by anyone.
    pub fn is_locked(&self) -> QueueResult<bool> {
        let now = self.store.now();
        Ok(self.lease()?.is_some_and(|lease| lease.is_live(now)))
    }

    /// True while this manager holds a live lease.
    pub fn is_held(&self) -> QueueResult<bool> {
        let now = self.store.now();
        Ok(self
            .lease()?
            .is_some_and(|lease| lease.holder == self.holder && lease.is_live(now)))
    }
}

impl JobQueue {
    /// Take the processing lease.
    pub fn lock_queue(&self) -> QueueResult<bool> {
        let acquired = self.lock.lock()?;
        if acquired {
            self.emit(QueueEvent::LockAcquired {
                name: self.lock.name().to_string(),
                holder: self.lock.holder().to_string(),
            });
        } else {
            self.emit(QueueEvent::LockContended {
                name: self.lock.name().to_string(),
            });
        }
        Ok(acquired)
    }

    /// Extend the processing lease while a run is still going.
    pub fn renew_lock(&self) -> QueueResult<bool> {
        let renewed = self.lock.renew()?;
        if !renewed {
            warn!("Lost processing lease {} before renewal", self.lock.name());
        }
        Ok(renewed)
    }

    pub fn unlock_queue(&self) -> QueueResult<bool> {
        let released = self.lock.unlock()?;
        if released {
            self.emit(QueueEvent::LockReleased {
                name: self.lock.name().to_string(),
                holder: self.lock.holder().to_string(),
            });
        }
        Ok(released)
    }

    pub fn is_locked(&self) -> QueueResult<bool> {
        self.lock.is_locked()
    }

    /// Break the processing lease held by any process.
    pub fn force_unlock_queue(&self) -> QueueResult<bool> {
        let released = self.lock.force_unlock()?;
        if released {
            warn!("Processing lease {} force-released", self.lock.name());
            self.emit(QueueEvent::LockForced {
                name: self.lock.name().to_string(),
            });
        }
        Ok(released)
    }

    pub fn queue_lease(&self) -> QueueResult<Option<Lease>> {
        self.lock.lease()
    }
}

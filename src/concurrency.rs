//! Concurrency utilities shared by the transports and the scheduler.
//!
//! The browser backend keeps one long-lived page per site. Pages are not safe
//! to drive from two workers at once, so access goes through a [`SessionPool`]
//! that hands out exclusive, per-key leases.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed pool of reusable session handles with exclusive checkout.
///
/// Checking out a key blocks until no other lease for that key is alive.
/// Different keys never contend with each other.
pub struct SessionPool<H> {
    /// One slot per key; `None` until a handle is inserted
    slots: DashMap<String, Arc<Mutex<Option<H>>>>,
}

/// Exclusive access to the session slot of one key.
///
/// Dropping the lease returns the slot (and whatever handle it holds) to the pool.
pub struct SessionLease<H> {
    key: String,
    guard: OwnedMutexGuard<Option<H>>,
}

impl<H: Send + 'static> SessionPool<H> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Waits for exclusive access to the slot of `key`.
    pub async fn checkout(&self, key: &str) -> SessionLease<H> {
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let guard = slot.lock_owned().await;
        SessionLease {
            key: key.to_string(),
            guard,
        }
    }

    /// Whether a lease on `key` is currently held.
    pub fn is_checked_out(&self, key: &str) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of keys the pool has seen.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Removes every idle handle from the pool and returns them, e.g. to close
    /// them on shutdown. Slots under an active lease are left untouched.
    pub fn drain_idle(&self) -> Vec<H> {
        let mut handles = Vec::new();
        for slot in self.slots.iter() {
            if let Ok(mut guard) = slot.value().try_lock() {
                if let Some(handle) = guard.take() {
                    handles.push(handle);
                }
            }
        }
        handles
    }
}

impl<H: Send + 'static> Default for SessionPool<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SessionLease<H> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self) -> Option<&H> {
        self.guard.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut H> {
        self.guard.as_mut()
    }

    /// Stores a fresh handle in the slot, replacing any previous one.
    pub fn insert(&mut self, handle: H) -> &mut H {
        self.guard.insert(handle)
    }

    /// Takes the handle out so the next checkout starts a new session.
    pub fn invalidate(&mut self) -> Option<H> {
        self.guard.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn checkout_is_exclusive_per_key() {
        let pool: Arc<SessionPool<u32>> = Arc::new(SessionPool::new());

        let mut lease = pool.checkout("hdsky").await;
        lease.insert(1);
        assert!(pool.is_checked_out("hdsky"));

        let contender = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let lease = pool.checkout("hdsky").await;
                lease.get().copied()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        let other = tokio::time::timeout(Duration::from_millis(50), pool.checkout("btschool")).await;
        assert!(other.is_ok(), "different keys must not contend");
        drop(other);

        drop(lease);
        let seen = contender.await.unwrap();
        assert_eq!(seen, Some(1), "handle is reused by the next lease");
    }

    #[tokio::test]
    async fn invalidate_clears_the_slot() {
        let pool: SessionPool<String> = SessionPool::new();
        {
            let mut lease = pool.checkout("site").await;
            lease.insert("page".to_string());
            assert_eq!(lease.invalidate().as_deref(), Some("page"));
        }
        let lease = pool.checkout("site").await;
        assert!(lease.get().is_none());
    }

    #[tokio::test]
    async fn drain_skips_active_leases() {
        let pool: SessionPool<u8> = SessionPool::new();
        pool.checkout("a").await.insert(1);
        let mut busy = pool.checkout("b").await;
        busy.insert(2);

        assert_eq!(pool.drain_idle(), vec![1]);
        assert_eq!(busy.get(), Some(&2));
        assert_eq!(pool.len(), 2);
    }
}

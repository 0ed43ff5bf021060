//! Per-instance try-locks with staleness release.
//!
//! Recreation and residual swaps each take one of these. Contending callers
//! are rejected instead of queued. A lock held longer than the staleness
//! ceiling is assumed abandoned and handed to the next caller.

use crate::error::{ExecutionError, ExecutionResult};
use lp_keeper_domain::InstanceId;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Default staleness ceiling.
pub const DEFAULT_LOCK_STALENESS: Duration = Duration::from_secs(300); // 5 minutes

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Recreation,
    Swap,
}

impl LockKind {
    pub fn name(&self) -> &'static str {
        match self {
            LockKind::Recreation => "recreation",
            LockKind::Swap => "swap",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    generation: u64,
    acquired_at: Instant,
}

#[derive(Debug, Default)]
struct LockSlot {
    holder: Option<Holder>,
    next_generation: u64,
}

#[derive(Debug)]
struct LockInner {
    kind: LockKind,
    staleness: Duration,
    slot: Mutex<LockSlot>,
}

impl LockInner {
    fn slot(&self) -> MutexGuard<'_, LockSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A non-reentrant, non-queueing lock owned by one instance.
#[derive(Debug, Clone)]
pub struct InstanceLock {
    inner: Arc<LockInner>,
}

/// Successful acquisition.
#[derive(Debug)]
pub struct LockAcquisition {
    pub guard: LockGuard,
    /// Set when a stale holder was evicted; how long it had held the lock.
    pub forced_release: Option<Duration>,
}

impl InstanceLock {
    #[must_use]
    pub fn new(kind: LockKind, staleness: Duration) -> Self {
        Self {
            inner: Arc::new(LockInner {
                kind,
                staleness,
                slot: Mutex::new(LockSlot::default()),
            }),
        }
    }

    /// Takes the lock, evicting a holder older than the staleness ceiling.
    ///
    /// # Errors
    /// [`ExecutionError::LockContention`] while a fresh holder exists.
    pub fn try_acquire(&self, instance: &InstanceId) -> ExecutionResult<LockAcquisition> {
        let now = Instant::now();
        let mut slot = self.inner.slot();

        let forced_release = match slot.holder {
            Some(holder) => {
                let held_for = now.saturating_duration_since(holder.acquired_at);
                if held_for < self.inner.staleness {
                    return Err(ExecutionError::LockContention {
                        instance: instance.clone(),
                        lock: self.inner.kind.name(),
                    });
                }
                Some(held_for)
            }
            None => None,
        };

        slot.next_generation += 1;
        let generation = slot.next_generation;
        slot.holder = Some(Holder {
            generation,
            acquired_at: now,
        });

        Ok(LockAcquisition {
            guard: LockGuard {
                inner: Arc::clone(&self.inner),
                generation,
            },
            forced_release,
        })
    }

    pub fn is_held(&self) -> bool {
        self.inner.slot().holder.is_some()
    }

    /// How long the current holder has had the lock.
    pub fn held_for(&self) -> Option<Duration> {
        self.inner
            .slot()
            .holder
            .map(|holder| holder.acquired_at.elapsed())
    }

    /// Drops the current holder regardless of age.
    pub fn force_release(&self) -> bool {
        self.inner.slot().holder.take().is_some()
    }
}

/// Releases the lock on drop, unless it was since handed to someone else.
#[derive(Debug)]
pub struct LockGuard {
    inner: Arc<LockInner>,
    generation: u64,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut slot = self.inner.slot();
        if slot
            .holder
            .is_some_and(|holder| holder.generation == self.generation)
        {
            slot.holder = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceId {
        InstanceId::from("i-1")
    }

    #[tokio::test]
    async fn test_contention_is_rejected() {
        let lock = InstanceLock::new(LockKind::Recreation, DEFAULT_LOCK_STALENESS);
        let first = lock.try_acquire(&instance()).unwrap();
        assert!(first.forced_release.is_none());

        let second = lock.try_acquire(&instance());
        assert!(matches!(
            second,
            Err(ExecutionError::LockContention {
                lock: "recreation",
                ..
            })
        ));

        drop(first);
        assert!(!lock.is_held());
        assert!(lock.try_acquire(&instance()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_lock_is_force_released() {
        let lock = InstanceLock::new(LockKind::Swap, DEFAULT_LOCK_STALENESS);
        let stale = lock.try_acquire(&instance()).unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(lock.try_acquire(&instance()).is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = lock.try_acquire(&instance()).unwrap();
        assert!(fresh.forced_release.unwrap() >= DEFAULT_LOCK_STALENESS);

        // The evicted holder finishing late must not free its successor's lock.
        drop(stale);
        assert!(lock.is_held());
        drop(fresh);
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_force_release() {
        let lock = InstanceLock::new(LockKind::Swap, DEFAULT_LOCK_STALENESS);
        let guard = lock.try_acquire(&instance()).unwrap();
        assert!(lock.force_release());
        assert!(!lock.force_release());
        assert!(lock.try_acquire(&instance()).is_ok());
        drop(guard);
    }
}

//! Concurrency gate
//!
//! A platform-wide counting semaphore bounding the number of in-flight
//! reconciliations. A permit is held for the full duration of a single
//! reconcile invocation (provisioning, drift checks, and cleanup all
//! acquire identically) and released on drop.
//!
//! Waiters queue FIFO inside the tokio semaphore; superseding events for
//! the same store are coalesced upstream by the watch scheduler, so a stale
//! queued waiter is simply cancelled when its acquire future is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds parallel reconciliation work across all stores.
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    waiters: AtomicUsize,
}

/// RAII permit for one reconcile invocation.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    /// Create a gate with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            waiters: AtomicUsize::new(0),
        }
    }

    /// Acquire a slot without waiting. Returns `None` when the gate is full;
    /// the caller requeues instead of blocking a worker.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| GatePermit { _permit: permit })
    }

    /// Acquire a slot, waiting FIFO up to `wait`. The waiter count is
    /// exported as the `concurrency_gate_waiters` gauge while queued.
    pub async fn acquire_timeout(&self, wait: Duration) -> Option<GatePermit> {
        if let Some(permit) = self.try_acquire() {
            return Some(permit);
        }
        self.waiters.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("concurrency_gate_waiters").increment(1.0);
        let result = tokio::time::timeout(wait, self.semaphore.clone().acquire_owned()).await;
        self.waiters.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("concurrency_gate_waiters").decrement(1.0);
        match result {
            Ok(Ok(permit)) => Some(GatePermit { _permit: permit }),
            // Timed out, or the semaphore was closed during shutdown.
            _ => None,
        }
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently queued waiters.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let gate = ConcurrencyGate::new(2);
        let p1 = gate.try_acquire();
        let p2 = gate.try_acquire();
        assert!(p1.is_some());
        assert!(p2.is_some());
        assert!(gate.try_acquire().is_none());
        drop(p1);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_permit_releases_on_drop() {
        let gate = ConcurrencyGate::new(1);
        {
            let _permit = gate.try_acquire().unwrap();
            assert_eq!(gate.available(), 0);
        }
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_acquire_timeout_waits_for_release() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let permit = gate.try_acquire().unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire_timeout(Duration::from_secs(5)).await })
        };

        // Give the waiter time to queue, then release.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.waiters(), 1);
        drop(permit);

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_some());
        assert_eq!(gate.waiters(), 0);
    }

    #[tokio::test]
    async fn test_acquire_timeout_gives_up() {
        let gate = ConcurrencyGate::new(1);
        let _held = gate.try_acquire().unwrap();
        let got = gate.acquire_timeout(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_active_never_exceeds_capacity() {
        use std::sync::atomic::AtomicUsize;

        let gate = Arc::new(ConcurrencyGate::new(3));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let gate = gate.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire_timeout(Duration::from_secs(5)).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}

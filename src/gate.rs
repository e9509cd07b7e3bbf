//! Admission gate: bounds how many requests may be waiting on the engine.
//!
//! Built on a tokio [`Semaphore`], which queues waiters in FIFO order, so
//! admission under contention is first-come first-served. A request that
//! cannot get a permit within the queue timeout is rejected as busy instead
//! of waiting indefinitely.
//!
//! Permits are RAII: dropping a [`Permit`] releases it, which makes release
//! exactly-once on every path (early return, error, panic, cancellation).

use std::sync::Arc;
use std::time::Duration;

use prometheus::{IntCounter, IntGauge};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// No permit became free within the queue timeout.
    #[error("Timed out after {0:?} waiting for an admission permit")]
    TimedOut(Duration),

    /// The gate was shut down.
    #[error("Admission gate closed")]
    Closed,
}

/// Counting gate with capacity `N` and a bounded queue wait.
#[derive(Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    queue_timeout: Duration,
    in_use: IntGauge,
    rejections: IntCounter,
}

/// One unit of admitted concurrency. Released on drop.
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    in_use: IntGauge,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.in_use.dec();
    }
}

impl AdmissionGate {
    /// Create a gate. A capacity of 0 is raised to 1.
    pub fn new(capacity: usize, queue_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            queue_timeout,
            in_use: IntGauge::new("chat_gate_in_use", "Admission permits currently held")
                .expect("static metric name is valid"),
            rejections: IntCounter::new(
                "chat_gate_rejections_total",
                "Requests rejected because no permit freed up in time",
            )
            .expect("static metric name is valid"),
        }
    }

    /// Acquire a permit, waiting at most the configured queue timeout.
    pub async fn acquire(&self) -> Result<Permit, GateError> {
        self.acquire_within(self.queue_timeout).await
    }

    /// Acquire a permit, waiting at most `timeout`.
    pub async fn acquire_within(&self, timeout: Duration) -> Result<Permit, GateError> {
        let permit = match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(GateError::Closed),
            Err(_) => {
                self.rejections.inc();
                warn!(
                    capacity = self.capacity,
                    timeout_ms = timeout.as_millis() as u64,
                    "Admission gate busy, rejecting request"
                );
                return Err(GateError::TimedOut(timeout));
            }
        };

        self.in_use.inc();
        debug!(in_use = self.in_use(), capacity = self.capacity, "Permit acquired");
        Ok(Permit {
            _permit: permit,
            in_use: self.in_use.clone(),
        })
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn queue_timeout(&self) -> Duration {
        self.queue_timeout
    }

    /// Stop admitting; pending and future acquisitions fail with `Closed`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn in_use_gauge(&self) -> IntGauge {
        self.in_use.clone()
    }

    pub fn rejection_counter(&self) -> IntCounter {
        self.rejections.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let gate = AdmissionGate::new(2, Duration::from_millis(50));
        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_use(), 2);
        assert_eq!(gate.in_use_gauge().get(), 2);

        drop(a);
        assert_eq!(gate.in_use(), 1);
        drop(b);
        assert_eq!(gate.in_use(), 0);
        assert_eq!(gate.in_use_gauge().get(), 0);
    }

    #[tokio::test]
    async fn test_full_gate_times_out() {
        let gate = AdmissionGate::new(1, Duration::from_millis(20));
        let _held = gate.acquire().await.unwrap();

        let err = gate.acquire().await.unwrap_err();
        assert_eq!(err, GateError::TimedOut(Duration::from_millis(20)));
        assert_eq!(gate.rejection_counter().get(), 1);
        assert_eq!(gate.in_use(), 1);
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let gate = AdmissionGate::new(1, Duration::from_secs(5));
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(gate.in_use(), 0);
    }

    #[tokio::test]
    async fn test_waiters_admitted_in_arrival_order() {
        let gate = AdmissionGate::new(1, Duration::from_secs(5));
        let held = gate.acquire().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut waiters = Vec::new();
        for i in 0..3 {
            let gate = gate.clone();
            let tx = tx.clone();
            waiters.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                tx.send(i).unwrap();
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(held);
        for w in waiters {
            w.await.unwrap();
        }

        let order: Vec<i32> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_zero_capacity_raised_to_one() {
        let gate = AdmissionGate::new(0, Duration::from_millis(10));
        assert_eq!(gate.capacity(), 1);
        assert!(gate.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_gate() {
        let gate = AdmissionGate::new(1, Duration::from_millis(10));
        gate.close();
        assert_eq!(gate.acquire().await.unwrap_err(), GateError::Closed);
    }

    #[tokio::test]
    async fn test_close_fails_queued_waiter() {
        let gate = AdmissionGate::new(1, Duration::from_secs(5));
        let _held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.close();
        assert_eq!(waiter.await.unwrap(), Err(GateError::Closed));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_still_admits() {
        let gate = AdmissionGate::new(1, Duration::MAX);
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[derive(Debug, Clone)]
    enum Op {
        /// Hold a permit for this many milliseconds.
        Hold(u64),
        /// Start acquiring, then abort the task.
        Cancel(u64),
        /// Acquire, then panic while holding.
        Panic,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u64..5).prop_map(Op::Hold),
            2 => (0u64..5).prop_map(Op::Cancel),
            1 => Just(Op::Panic),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_permits_return_to_zero(
            capacity in 1usize..4,
            ops in proptest::collection::vec(arb_op(), 1..24),
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let gate = AdmissionGate::new(capacity, Duration::from_millis(3));
                let mut tasks = Vec::new();
                for op in ops {
                    let gate = gate.clone();
                    let cancel = matches!(op, Op::Cancel(_));
                    let task = tokio::spawn(async move {
                        match op {
                            Op::Hold(ms) => {
                                if let Ok(_permit) = gate.acquire().await {
                                    tokio::time::sleep(Duration::from_millis(ms)).await;
                                }
                            }
                            Op::Cancel(ms) => {
                                let _permit = gate.acquire().await;
                                tokio::time::sleep(Duration::from_millis(ms + 50)).await;
                            }
                            Op::Panic => {
                                if let Ok(_permit) = gate.acquire().await {
                                    panic!("request handler failed");
                                }
                            }
                        }
                    });
                    tasks.push((cancel, task));
                }

                for (cancel, task) in &tasks {
                    if *cancel {
                        task.abort();
                    }
                    assert!(gate.in_use() <= capacity);
                }
                for (_, task) in tasks {
                    let _ = task.await;
                }
                assert_eq!(gate.in_use(), 0);
                assert_eq!(gate.in_use_gauge().get(), 0);
            });
        }
    }
}

//! The idempotency guard itself.

use chrono::{Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{IdempotencyError, Result};
use crate::store::{BeginOutcome, IdempotencyStore};

/// How a guarded call obtained its result.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome<T> {
    /// The operation ran during this call.
    Executed(T),

    /// A previous call already completed; the recorded result was replayed
    /// without running the operation again.
    Replayed(T),
}

impl<T> ExecutionOutcome<T> {
    /// Returns the result regardless of how it was obtained.
    pub fn into_inner(self) -> T {
        match self {
            ExecutionOutcome::Executed(value) | ExecutionOutcome::Replayed(value) => value,
        }
    }

    /// Returns true if the result came from a recorded earlier execution.
    pub fn was_replayed(&self) -> bool {
        matches!(self, ExecutionOutcome::Replayed(_))
    }
}

/// How long a losing caller waits for the winner's terminal result before
/// giving up with `OperationInProgress`.
#[derive(Debug, Clone, Copy)]
pub struct WaitConfig {
    pub max_wait: std::time::Duration,
    pub poll_interval: std::time::Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            max_wait: std::time::Duration::from_secs(5),
            poll_interval: std::time::Duration::from_millis(50),
        }
    }
}

/// Wraps side-effecting operations so retries with the same key do not run
/// the work twice.
///
/// Terminal records are retained for `ttl` after they are written; a pending
/// record never expires, so a slow in-flight operation is not silently
/// re-executed.
#[derive(Clone)]
pub struct IdempotencyGuard<S> {
    store: S,
    ttl: Duration,
    wait: Option<WaitConfig>,
}

impl<S: IdempotencyStore> IdempotencyGuard<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            wait: None,
        }
    }

    /// Makes losing callers wait for the winner's terminal result instead
    /// of failing fast.
    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs `op` under the given key.
    ///
    /// Exactly one concurrent caller per key runs the operation. Without a
    /// wait config, a caller that loses the race gets `OperationInProgress`
    /// and should retry later, by which point the recorded result is
    /// replayed. With one, the loser polls for the winner's terminal record
    /// until the deadline: a completed record is replayed as the loser's
    /// own result; a failed one frees the key, so the loser re-attempts the
    /// operation itself. A failed operation is recorded and surfaced as
    /// `OperationFailed`; a later call with the same key attempts the
    /// operation again.
    #[tracing::instrument(skip(self, op))]
    pub async fn execute<T, E, F, Fut>(&self, key: &str, op: F) -> Result<ExecutionOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        E: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match self.acquire(key).await? {
            BeginOutcome::Acquired => match op().await {
                Ok(value) => {
                    let recorded = serde_json::to_value(&value)?;
                    self.store.complete(key, recorded, Utc::now() + self.ttl).await?;
                    Ok(ExecutionOutcome::Executed(value))
                }
                Err(error) => {
                    let message = error.to_string();
                    tracing::warn!(key, error = %message, "guarded operation failed");
                    self.store.fail(key, &message, Utc::now() + self.ttl).await?;
                    Err(IdempotencyError::OperationFailed {
                        key: key.to_string(),
                        message,
                    })
                }
            },
            BeginOutcome::InFlight => Err(IdempotencyError::OperationInProgress {
                key: key.to_string(),
            }),
            BeginOutcome::Completed(recorded) => {
                tracing::debug!(key, "replaying recorded result");
                let value: T = serde_json::from_value(recorded)?;
                Ok(ExecutionOutcome::Replayed(value))
            }
        }
    }

    /// Attempts to take the key, polling until the deadline when a wait
    /// config is set. Never returns `InFlight` before the deadline: a
    /// winner that completes is surfaced as `Completed`, one that fails
    /// frees the key and a later poll acquires it.
    async fn acquire(&self, key: &str) -> Result<BeginOutcome> {
        let outcome = self.store.begin(key, Utc::now()).await?;

        let Some(wait) = self.wait else {
            return Ok(outcome);
        };
        if !matches!(outcome, BeginOutcome::InFlight) {
            return Ok(outcome);
        }

        let deadline = tokio::time::Instant::now() + wait.max_wait;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Ok(BeginOutcome::InFlight);
            }
            tokio::time::sleep(wait.poll_interval).await;

            let outcome = self.store.begin(key, Utc::now()).await?;
            if !matches!(outcome, BeginOutcome::InFlight) {
                return Ok(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryIdempotencyStore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn guard() -> IdempotencyGuard<InMemoryIdempotencyStore> {
        IdempotencyGuard::new(InMemoryIdempotencyStore::new(), Duration::hours(1))
    }

    #[tokio::test]
    async fn test_first_call_executes() {
        let guard = guard();

        let outcome = guard
            .execute("create-invoice:abc123", || async {
                Ok::<_, std::convert::Infallible>(serde_json::json!({"invoice": 42}))
            })
            .await
            .unwrap();

        assert!(!outcome.was_replayed());
        assert_eq!(outcome.into_inner(), serde_json::json!({"invoice": 42}));
    }

    #[tokio::test]
    async fn test_retry_replays_without_rerunning() {
        let guard = guard();
        let calls = Arc::new(AtomicU32::new(0));

        for expect_replay in [false, true] {
            let calls = calls.clone();
            let outcome = guard
                .execute("create-invoice:abc123", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::convert::Infallible>(7u32)
                })
                .await
                .unwrap();
            assert_eq!(outcome.was_replayed(), expect_replay);
            assert_eq!(outcome.into_inner(), 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_execute_once() {
        let guard = Arc::new(guard());
        let calls = Arc::new(AtomicU32::new(0));

        let run = |guard: Arc<IdempotencyGuard<InMemoryIdempotencyStore>>,
                   calls: Arc<AtomicU32>| async move {
            guard
                .execute("charge:order-42", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok::<_, std::convert::Infallible>(())
                })
                .await
        };

        let (a, b) = tokio::join!(
            run(guard.clone(), calls.clone()),
            run(guard.clone(), calls.clone())
        );

        // Exactly one caller ran the operation. The loser observed the key
        // in flight and bailed out.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let losers = [a, b]
            .into_iter()
            .filter(|r| matches!(r, Err(IdempotencyError::OperationInProgress { .. })))
            .count();
        assert_eq!(losers, 1);
    }

    #[tokio::test]
    async fn test_waiting_loser_replays_the_winners_result() {
        let guard = Arc::new(guard().with_wait(WaitConfig {
            max_wait: std::time::Duration::from_secs(2),
            poll_interval: std::time::Duration::from_millis(10),
        }));
        let calls = Arc::new(AtomicU32::new(0));

        let run = |guard: Arc<IdempotencyGuard<InMemoryIdempotencyStore>>,
                   calls: Arc<AtomicU32>| async move {
            guard
                .execute("create-invoice:abc123", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok::<_, std::convert::Infallible>(41u32)
                })
                .await
        };

        let (a, b) = tokio::join!(
            run(guard.clone(), calls.clone()),
            run(guard.clone(), calls.clone())
        );

        // The operation ran once, and both callers got its result: the
        // loser waited out the winner and replayed the record.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.clone().into_inner(), 41);
        assert_eq!(b.clone().into_inner(), 41);
        assert_eq!(
            [&a, &b].iter().filter(|o| o.was_replayed()).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_wait_deadline_expires_into_operation_in_progress() {
        let guard = Arc::new(guard().with_wait(WaitConfig {
            max_wait: std::time::Duration::from_millis(30),
            poll_interval: std::time::Duration::from_millis(5),
        }));

        let winner = {
            let guard = guard.clone();
            async move {
                guard
                    .execute("slow:1", || async {
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        Ok::<_, std::convert::Infallible>(())
                    })
                    .await
            }
        };
        let loser = {
            let guard = guard.clone();
            async move {
                // Enter after the winner holds the key.
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                guard
                    .execute("slow:1", || async {
                        Ok::<_, std::convert::Infallible>(())
                    })
                    .await
            }
        };

        let (winner, loser) = tokio::join!(winner, loser);
        winner.unwrap();
        assert!(matches!(
            loser,
            Err(IdempotencyError::OperationInProgress { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_operation_is_recorded_and_reattemptable() {
        let guard = guard();
        let calls = Arc::new(AtomicU32::new(0));

        let failing_calls = calls.clone();
        let err = guard
            .execute("flaky:1", move || async move {
                failing_calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>("downstream unavailable")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::OperationFailed { .. }));

        // The failure is recorded against the key.
        let record = guard
            .store()
            .get("flaky:1", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.error.as_deref(), Some("downstream unavailable"));

        // A later call attempts the operation again.
        let retry_calls = calls.clone();
        let outcome = guard
            .execute("flaky:1", move || async move {
                retry_calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(9u32)
            })
            .await
            .unwrap();

        assert!(!outcome.was_replayed());
        assert_eq!(outcome.into_inner(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_interfere() {
        let guard = guard();

        let a = guard
            .execute("create-invoice:a", || async {
                Ok::<_, std::convert::Infallible>(1u32)
            })
            .await
            .unwrap();
        let b = guard
            .execute("create-invoice:b", || async {
                Ok::<_, std::convert::Infallible>(2u32)
            })
            .await
            .unwrap();

        assert_eq!(a.into_inner(), 1);
        assert_eq!(b.into_inner(), 2);
    }
}

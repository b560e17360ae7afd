//! Keyed de-duplication of concurrent work.
//!
//! A [`CallGroup`] guarantees that at most one execution of a given piece of
//! work is in flight per key. Callers that arrive while an execution is
//! running block until it finishes and receive the same result. The entry is
//! removed as soon as the execution completes, so a later call with the same
//! key starts a fresh execution.
//!
//! The SSH dialer uses this to collapse reconnect storms: any number of
//! streams failing over a dead transport results in a single connection
//! attempt.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// De-duplicates concurrent executions by string key.
pub struct CallGroup<T> {
    in_flight: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T> Default for CallGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CallGroup<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + 'static> CallGroup<T> {
    /// Executes `work`, making sure that only one execution is in flight for
    /// `key` at a time. If a duplicate comes in, the duplicate caller waits
    /// for the original to complete and receives the same result.
    ///
    /// The work future runs outside the map lock, so a slow call never blocks
    /// callers with unrelated keys.
    pub async fn call_synchronized<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: Fn() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            let waiter = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(key) {
                    Some(tx) => Some(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        in_flight.insert(key.to_string(), tx);
                        None
                    }
                }
            };

            match waiter {
                Some(mut rx) => match rx.recv().await {
                    Ok(result) => return result,
                    // The in-flight execution was dropped before completing;
                    // start over with a fresh one.
                    Err(_) => continue,
                },
                None => {
                    let guard = InFlightGuard { group: self, key };
                    let result = work().await;
                    guard.complete(result.clone());
                    return result;
                }
            }
        }
    }
}

/// Removes the in-flight entry even if the leader's future is dropped
/// mid-execution, so waiters wake up and retry instead of hanging.
struct InFlightGuard<'a, T> {
    group: &'a CallGroup<T>,
    key: &'a str,
}

impl<T: Clone> InFlightGuard<'_, T> {
    fn complete(self, result: T) {
        if let Some(tx) = self.group.in_flight.lock().remove(self.key) {
            let _ = tx.send(result);
        }
        std::mem::forget(self);
    }
}

impl<T> Drop for InFlightGuard<'_, T> {
    fn drop(&mut self) {
        self.group.in_flight.lock().remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let group = Arc::new(CallGroup::<usize>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = group.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                group
                    .call_synchronized("connect", || {
                        let executions = executions.clone();
                        async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            executions.fetch_add(1, Ordering::SeqCst)
                        }
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| *r == results[0]));
    }

    #[tokio::test]
    async fn sequential_calls_execute_again() {
        let group = CallGroup::<usize>::new();
        let executions = AtomicUsize::new(0);

        for _ in 0..3 {
            group
                .call_synchronized("reconnect", || async {
                    executions.fetch_add(1, Ordering::SeqCst)
                })
                .await;
        }

        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let group = Arc::new(CallGroup::<&'static str>::new());

        let slow_group = group.clone();
        let slow = tokio::spawn(async move {
            slow_group
                .call_synchronized("slow", || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "slow"
                })
                .await
        });

        // The fast key must complete long before the slow one.
        let fast = tokio::time::timeout(
            Duration::from_millis(500),
            group.call_synchronized("fast", || async { "fast" }),
        )
        .await;

        assert_eq!(fast.unwrap(), "fast");
        slow.abort();
    }
}

//! Provides request coalescing: at most one in-flight load per key.
//!
//! When many callers miss the cache on the same key at the same time, naively each of them
//! would hit the backend (or a peer) on its own. [SingleFlight::do_once] collapses such a
//! stampede into a single execution: the first caller for a key becomes the *executor* and
//! actually runs the given action, everybody else arriving while the action is in flight
//! becomes a *waiter* and simply receives a clone of the executor's result.
//!
//! The registration for a key is removed **before** the waiters are woken, so a call
//! arriving after completion starts a fresh flight - results are shared, never cached.
//! If the executing task dies without producing a result (e.g. it panicked), the waiters
//! receive [CacheError::FlightAbandoned] instead of hanging forever.
//!
//! # Example
//! ```
//! # use nexuscache::singleflight::SingleFlight;
//! # #[tokio::main]
//! # async fn main() {
//! let flight: SingleFlight<String> = SingleFlight::new();
//!
//! let value = flight
//!     .do_once("answer", || async { Ok("42".to_owned()) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, "42");
//! # }
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::errors::CacheError;

/// Coalesces concurrent calls per key so that the wrapped action runs at most once.
///
/// The generic parameter is the result type shared among all callers. It has to be **Clone**
/// as every waiter receives its own copy - for cache values this is a cheap reference
/// counted [ByteView](crate::cache::ByteView) clone.
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, broadcast::Sender<Result<T, CacheError>>>>,
}

/// The role a caller ends up with after registering for a key.
enum FlightRole<T> {
    /// Someone else is already loading this key - await their result.
    Waiter(broadcast::Receiver<Result<T, CacheError>>),
    /// Nobody is - run the action and publish the result via this sender.
    Executor(broadcast::Sender<Result<T, CacheError>>),
}

/// Removes the registration for a key once the executor is done with it - no matter how.
///
/// This guard makes the de-registration panic safe: if the action unwinds, the flight is
/// deregistered and the broadcast sender is dropped, which surfaces as
/// [CacheError::FlightAbandoned] on all waiters.
struct FlightGuard<'a, T> {
    flight: &'a SingleFlight<T>,
    key: String,
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.flight.calls.lock().unwrap().remove(&self.key);
    }
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    /// Creates a new, empty coalescer.
    pub fn new() -> Self {
        SingleFlight {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Executes the given action, unless another call for the same key is already in
    /// flight - in that case the result of that call is awaited and returned.
    ///
    /// Invariants:
    /// * per key, at most one action runs at any point in time,
    /// * every caller (the executor included) observes the same result,
    /// * the registration is gone before any caller returns, so follow-up calls start a
    ///   fresh flight.
    pub async fn do_once<F, Fut>(&self, key: &str, action: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let tx = match self.register(key) {
            FlightRole::Waiter(mut rx) => {
                return match rx.recv().await {
                    Ok(result) => result,
                    Err(_) => Err(CacheError::FlightAbandoned {
                        key: key.to_owned(),
                    }),
                };
            }
            FlightRole::Executor(tx) => tx,
        };

        // We are the executor: run the action without holding the lock...
        let guard = FlightGuard {
            flight: self,
            key: key.to_owned(),
        };
        let result = action().await;

        // ...deregister first, then wake the waiters (missing receivers are fine).
        drop(guard);
        let _ = tx.send(result.clone());

        result
    }

    /// Registers the caller for the given key.
    ///
    /// Waiters subscribe while holding the map lock. As the executor deregisters under
    /// the same lock *before* it publishes, a subscription obtained here is guaranteed to
    /// receive the result.
    fn register(&self, key: &str) -> FlightRole<T> {
        let mut calls = self.calls.lock().unwrap();

        if let Some(tx) = calls.get(key) {
            return FlightRole::Waiter(tx.subscribe());
        }

        let (tx, _) = broadcast::channel(1);
        let _ = calls.insert(key.to_owned(), tx.clone());
        FlightRole::Executor(tx)
    }
}

impl<T: Clone + Send + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        SingleFlight::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::CacheError;
    use crate::singleflight::SingleFlight;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_calls_share_one_execution() {
        let flight: Arc<SingleFlight<u64>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let flight = flight.clone();
            let executions = executions.clone();
            tasks.push(tokio::spawn(async move {
                flight
                    .do_once("key", || async {
                        let _ = executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_shared_and_not_cached() {
        let flight: Arc<SingleFlight<u64>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let flight = flight.clone();
            let executions = executions.clone();
            tasks.push(tokio::spawn(async move {
                flight
                    .do_once("key", || async {
                        let _ = executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(CacheError::Backend {
                            key: "key".to_owned(),
                            message: "boom".to_owned(),
                        })
                    })
                    .await
            }));
        }

        for task in tasks {
            let result: Result<u64, CacheError> = task.await.unwrap();
            assert_eq!(
                result.unwrap_err(),
                CacheError::Backend {
                    key: "key".to_owned(),
                    message: "boom".to_owned(),
                }
            );
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        // A failed flight must not leave a negative cache behind - the next call runs the
        // action again...
        let value = flight
            .do_once("key", || async {
                let _ = executions.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn different_keys_do_not_coalesce() {
        let flight: Arc<SingleFlight<u64>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..10u64 {
            let flight = flight.clone();
            let executions = executions.clone();
            tasks.push(tokio::spawn(async move {
                flight
                    .do_once(&format!("key-{}", i), || async {
                        let _ = executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(i)
                    })
                    .await
            }));
        }

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap().unwrap(), i as u64);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn a_dying_executor_fails_its_waiters_explicitly() {
        let flight: Arc<SingleFlight<u64>> = Arc::new(SingleFlight::new());

        // The executor enters the flight and then dies...
        let executor = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .do_once("key", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        if true {
                            panic!("backend exploded");
                        }
                        Ok(0)
                    })
                    .await
            })
        };

        // ...while a waiter joins the in-flight load.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiter = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.do_once("key", || async { Ok(1) }).await })
        };

        assert_eq!(executor.await.is_err(), true);
        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            CacheError::FlightAbandoned {
                key: "key".to_owned(),
            }
        );
    }
}

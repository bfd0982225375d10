//! Single-flight collapsing of identical async requests
//!
//! A [`TaskSingler`] maps request keys to in-flight shared futures.  The
//! first caller under a key invokes the factory; every caller that joins
//! while the work is in flight awaits the same future and observes the same
//! eventual output (cloned to each joiner).  The cache entry is removed once
//! the shared future settles, success or failure alike, so a later request
//! under the same key starts fresh.
//!
//! There is intentionally no cancellation propagation: a caller abandoning
//! its await does not abort the shared operation for others still awaiting
//! it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::future::Shared;
use futures::FutureExt as _;

type SharedTask<T> = Shared<Pin<Box<dyn Future<Output = T> + Send>>>;

struct InFlight<T: Clone> {
    generation: u64,
    task: SharedTask<T>,
}

/// Collapses concurrent identical async requests into one execution.
///
/// # Examples
///
/// ```
/// use dynauth::singler::TaskSingler;
///
/// # tokio_test::block_on(async {
/// let singler: TaskSingler<u32> = TaskSingler::new();
///
/// let (a, b) = tokio::join!(
///     singler.get_or_create("answer", || async {
///         tokio::task::yield_now().await;
///         42
///     }),
///     // Joins the in-flight request; this factory never runs.
///     singler.get_or_create("answer", || async { unreachable!() }),
/// );
///
/// assert_eq!(a, 42);
/// assert_eq!(b, 42);
/// # });
/// ```
pub struct TaskSingler<T: Clone> {
    in_flight: Mutex<HashMap<String, InFlight<T>>>,
    generations: AtomicU64,
}

impl<T: Clone> Default for TaskSingler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> TaskSingler<T> {
    /// Creates an empty singler.
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Returns `true` when no request is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + Sync + 'static> TaskSingler<T> {
    /// Returns the in-flight result for `key`, starting it via `factory`
    /// when none exists.
    ///
    /// Guarantees at most one concurrent invocation of `factory` per key;
    /// every caller joining while the work is in flight resolves to the
    /// same output value.  The factory is only called for the caller that
    /// creates the entry.
    pub async fn get_or_create<F, Fut>(&self, key: &str, factory: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (generation, task) = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(key) {
                Some(entry) => (entry.generation, entry.task.clone()),
                None => {
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    let task: SharedTask<T> = factory().boxed().shared();
                    in_flight.insert(
                        key.to_string(),
                        InFlight {
                            generation,
                            task: task.clone(),
                        },
                    );
                    (generation, task)
                }
            }
        };

        let output = task.await;

        // The entry is settled; drop it so the next request starts fresh.
        // A newer request may already have replaced it, hence the
        // generation check -- every joiner runs this and only the entry
        // they awaited is removed.
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight
            .get(key)
            .map_or(false, |entry| entry.generation == generation)
        {
            in_flight.remove(key);
        }

        output
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::error::DynauthError;

    #[tokio::test]
    async fn test_concurrent_calls_share_one_invocation() {
        let singler: Arc<TaskSingler<u32>> = Arc::new(TaskSingler::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let make = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            7u32
        };

        let (a, b, c) = tokio::join!(
            singler.get_or_create("k", || make(Arc::clone(&calls))),
            singler.get_or_create("k", || make(Arc::clone(&calls))),
            singler.get_or_create("k", || make(Arc::clone(&calls))),
        );

        assert_eq!((a, b, c), (7, 7, 7));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "factory ran exactly once");
    }

    #[tokio::test]
    async fn test_joined_callers_share_the_same_error() {
        let singler: Arc<TaskSingler<Result<u32, DynauthError>>> = Arc::new(TaskSingler::new());

        let failing = || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(DynauthError::TokenExchange("shared failure".to_string()))
        };

        let (a, b) = tokio::join!(
            singler.get_or_create("k", failing),
            singler.get_or_create("k", failing),
        );

        assert_eq!(a, b, "both joiners observe the same error value");
        assert!(matches!(a, Err(DynauthError::TokenExchange(_))));
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let singler: Arc<TaskSingler<u32>> = Arc::new(TaskSingler::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let make = |calls: Arc<AtomicUsize>, value: u32| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            value
        };

        let (a, b) = tokio::join!(
            singler.get_or_create("one", || make(Arc::clone(&calls), 1)),
            singler.get_or_create("two", || make(Arc::clone(&calls), 2)),
        );

        assert_eq!((a, b), (1, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_entry_is_removed_after_settlement() {
        let singler: TaskSingler<u32> = TaskSingler::new();

        singler.get_or_create("k", || async { 1 }).await;
        assert!(singler.is_empty(), "settled entry must be dropped");

        // A fresh request under the same key runs a fresh factory.
        let second = singler.get_or_create("k", || async { 2 }).await;
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_entry_is_removed_after_failure() {
        let singler: TaskSingler<Result<u32, DynauthError>> = TaskSingler::new();

        let first = singler
            .get_or_create("k", || async { Err(DynauthError::Cancelled) })
            .await;
        assert!(first.is_err());
        assert!(singler.is_empty(), "failed entry must be dropped too");

        let second = singler.get_or_create("k", || async { Ok(9) }).await;
        assert_eq!(second, Ok(9));
    }

    #[tokio::test]
    async fn test_abandoning_one_caller_does_not_abort_the_shared_task() {
        let singler: Arc<TaskSingler<u32>> = Arc::new(TaskSingler::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in = Arc::clone(&calls);
        let first = {
            let singler = Arc::clone(&singler);
            tokio::spawn(async move {
                singler
                    .get_or_create("k", move || async move {
                        calls_in.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        11u32
                    })
                    .await
            })
        };

        // Give the first caller time to install the entry, then join and
        // abort the first caller's wait.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let singler = Arc::clone(&singler);
            tokio::spawn(
                async move { singler.get_or_create("k", || async { unreachable!() }).await },
            )
        };
        first.abort();

        let result = second.await.expect("second caller completes");
        assert_eq!(result, 11, "shared task survives the aborted caller");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

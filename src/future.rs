//! Dependency-gated futures
//!
//! A [`Future`] is a computation that resolves exactly once. It is created
//! with a fixed set of upstream futures and starts on its own as soon as
//! all of them are done: each dependency keeps a (weak) list of waiters and
//! re-triggers [`Future::start`] on them when it completes.
//!
//! Bodies run on a bounded [`WorkerPool`]. A body never waits on another
//! future, since it is only queued once every dependency has resolved.
//! There is no cancellation: once a body is running it runs to completion.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::error::{KilnError, Result};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Bounded pool of worker threads that future bodies are queued on
#[derive(Clone)]
pub struct WorkerPool {
    pool: Arc<rayon::ThreadPool>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool with `workers` threads (0 = available parallelism)
    pub fn new(workers: usize) -> Result<Self> {
        let size = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            workers
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("kiln-worker-{i}"))
            .build()
            .map_err(|e| KilnError::Pool {
                message: e.to_string(),
            })?;

        Ok(Self {
            pool: Arc::new(pool),
            size,
        })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.size
    }

    fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.pool.spawn(job);
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool").field("size", &self.size).finish()
    }
}

type Body<T> = Box<dyn FnOnce(Vec<T>) -> Result<T> + Send + 'static>;

struct Job<T> {
    pool: WorkerPool,
    body: Body<T>,
}

struct State<T> {
    outcome: Option<Result<T>>,
    /// Taken by whoever starts the body; `None` afterwards.
    job: Option<Job<T>>,
    waiters: Vec<Weak<Shared<T>>>,
}

struct Shared<T> {
    id: u64,
    state: Mutex<State<T>>,
    ready: Condvar,
    deps: Vec<Future<T>>,
}

/// Handle to a computation that resolves to a `Result<T>` exactly once
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = self.shared.state.lock().outcome.is_some();
        f.debug_struct("Future")
            .field("id", &self.shared.id)
            .field("deps", &self.shared.deps.len())
            .field("done", &done)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Create a future that runs `body` on `pool` once every dependency is done.
    ///
    /// `body` receives the dependency values in the order given. If a
    /// dependency failed, `body` is skipped and the future carries that error.
    pub fn new<F>(pool: &WorkerPool, deps: Vec<Future<T>>, body: F) -> Self
    where
        F: FnOnce(Vec<T>) -> Result<T> + Send + 'static,
    {
        let job = Job {
            pool: pool.clone(),
            body: Box::new(body),
        };
        let future = Self::with_state(deps, Some(job), None);

        for dep in &future.shared.deps {
            dep.add_waiter(&future.shared);
        }
        future.start();
        future
    }

    /// A future without a body, resolved by an explicit [`Future::complete`]
    pub fn pending() -> Self {
        Self::with_state(Vec::new(), None, None)
    }

    /// An already-resolved future
    pub fn ready(value: T) -> Self {
        Self::with_state(Vec::new(), None, Some(Ok(value)))
    }

    /// An already-failed future
    pub fn failed(err: KilnError) -> Self {
        Self::with_state(Vec::new(), None, Some(Err(err)))
    }

    fn with_state(deps: Vec<Future<T>>, job: Option<Job<T>>, outcome: Option<Result<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(State {
                    outcome,
                    job,
                    waiters: Vec::new(),
                }),
                ready: Condvar::new(),
                deps,
            }),
        }
    }

    /// Queue the body if every dependency is done. Safe to call repeatedly
    /// and concurrently; the body is handed to the pool at most once.
    pub fn start(&self) {
        start_shared(&self.shared);
    }

    /// Resolve the future. Returns `false` (and changes nothing) if it was
    /// already done. A body that has not started yet will never run.
    pub fn complete(&self, outcome: Result<T>) -> bool {
        complete_shared(&self.shared, outcome)
    }

    /// Block until the future is done and return a copy of its outcome
    pub fn await_result(&self) -> Result<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.shared.ready.wait(&mut state);
        }
    }

    fn add_waiter(&self, waiter: &Arc<Shared<T>>) {
        let mut state = self.shared.state.lock();
        if state.outcome.is_none() {
            state.waiters.push(Arc::downgrade(waiter));
        }
    }
}

impl<T> Future<T> {
    /// Non-blocking snapshot of the completion flag
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// Number of live futures registered as waiting on this one
    pub fn waiter_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .waiters
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Process-unique identifier, handy in logs
    pub fn id(&self) -> u64 {
        self.shared.id
    }
}

fn start_shared<T: Clone + Send + 'static>(shared: &Arc<Shared<T>>) {
    let job = {
        let mut state = shared.state.lock();
        if state.outcome.is_some() || state.job.is_none() {
            return;
        }
        // Lock order is always dependent -> dependency.
        if !shared.deps.iter().all(Future::is_done) {
            return;
        }
        state.job.take()
    };

    if let Some(Job { pool, body }) = job {
        let shared = Arc::clone(shared);
        pool.spawn(move || run_body(shared, body));
    }
}

fn run_body<T: Clone + Send + 'static>(shared: Arc<Shared<T>>, body: Body<T>) {
    let args = shared
        .deps
        .iter()
        .map(Future::await_result)
        .collect::<Result<Vec<T>>>();

    let outcome = match args {
        Ok(args) => panic::catch_unwind(AssertUnwindSafe(move || body(args)))
            .unwrap_or_else(|payload| {
                Err(KilnError::WorkerPanicked {
                    message: panic_message(payload.as_ref()),
                })
            }),
        Err(upstream) => Err(upstream),
    };

    complete_shared(&shared, outcome);
}

fn complete_shared<T: Clone + Send + 'static>(shared: &Arc<Shared<T>>, outcome: Result<T>) -> bool {
    let waiters = {
        let mut state = shared.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        state.job = None;
        shared.ready.notify_all();
        std::mem::take(&mut state.waiters)
    };

    for waiter in waiters {
        if let Some(waiter) = waiter.upgrade() {
            start_shared(&waiter);
        }
    }
    true
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn pool() -> WorkerPool {
        WorkerPool::new(4).unwrap()
    }

    #[test]
    fn test_ready_future_resolves_immediately() {
        let f = Future::ready(7);
        assert!(f.is_done());
        assert_eq!(f.await_result().unwrap(), 7);
        // callable again after completion
        assert_eq!(f.await_result().unwrap(), 7);
    }

    #[test]
    fn test_dependency_values_arrive_in_order() {
        let pool = pool();
        let a = Future::new(&pool, vec![], |_| Ok(1));
        let b = Future::new(&pool, vec![], |_| Ok(2));
        let c = Future::new(&pool, vec![a, b], |args| Ok(args[0] * 10 + args[1]));

        assert_eq!(c.await_result().unwrap(), 12);
    }

    #[test]
    fn test_waits_for_pending_dependency() {
        let pool = pool();
        let gate = Future::pending();
        let f = Future::new(&pool, vec![gate.clone()], |args| Ok(args[0] + 1));

        thread::sleep(Duration::from_millis(50));
        assert!(!f.is_done());
        assert_eq!(gate.waiter_count(), 1);

        assert!(gate.complete(Ok(41)));
        assert_eq!(f.await_result().unwrap(), 42);
    }

    #[test]
    fn test_complete_is_idempotent() {
        let f = Future::pending();
        assert!(f.complete(Ok(1)));
        assert!(!f.complete(Ok(2)));
        assert_eq!(f.await_result().unwrap(), 1);
    }

    #[test]
    fn test_completing_before_start_skips_body() {
        let pool = pool();
        let ran = Arc::new(AtomicUsize::new(0));
        let gate = Future::pending();
        let counter = Arc::clone(&ran);
        let f = Future::new(&pool, vec![gate.clone()], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        });

        assert!(f.complete(Ok(5)));
        gate.complete(Ok(0));
        thread::sleep(Duration::from_millis(50));

        assert_eq!(f.await_result().unwrap(), 5);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_body_runs_once_under_concurrent_start() {
        let pool = pool();
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Future::pending();
        let counter = Arc::clone(&runs);
        let f = Future::new(&pool, vec![gate.clone()], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        });

        let starters: Vec<_> = (0..8)
            .map(|_| {
                let f = f.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        f.start();
                    }
                })
            })
            .collect();
        gate.complete(Ok(0));
        for s in starters {
            s.join().unwrap();
        }

        assert_eq!(f.await_result().unwrap(), 3);
        f.start();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_every_waiting_thread_wakes() {
        let f: Future<i32> = Future::pending();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let f = f.clone();
                thread::spawn(move || f.await_result().unwrap())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        f.complete(Ok(9));

        for w in waiters {
            assert_eq!(w.join().unwrap(), 9);
        }
    }

    #[test]
    fn test_failure_propagates_without_running_dependent() {
        let pool = pool();
        let ran = Arc::new(AtomicUsize::new(0));
        let bad = Future::new(&pool, vec![], |_| Err(KilnError::eval("boom")));
        let counter = Arc::clone(&ran);
        let dependent = Future::new(&pool, vec![bad.clone()], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });

        let err = dependent.await_result().unwrap_err();
        assert!(matches!(err, KilnError::Eval { ref message } if message == "boom"));
        assert!(bad.await_result().is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_body_becomes_error() {
        let pool = pool();
        let f: Future<i32> = Future::new(&pool, vec![], |_| panic!("worker blew up"));

        let err = f.await_result().unwrap_err();
        assert!(matches!(err, KilnError::WorkerPanicked { ref message } if message.contains("blew up")));
    }

    #[test]
    fn test_single_worker_pool_drains_chain() {
        let pool = WorkerPool::new(1).unwrap();
        let mut prev = Future::new(&pool, vec![], |_| Ok(0));
        for _ in 0..50 {
            prev = Future::new(&pool, vec![prev], |args| Ok(args[0] + 1));
        }
        assert_eq!(prev.await_result().unwrap(), 50);
    }
}

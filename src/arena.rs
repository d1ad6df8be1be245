//! Arenas: ordered waves of futures
//!
//! An [`Arena`] groups the futures of one wave of concurrent work so the
//! caller can block once for the whole wave. [`Arena::chain`] links a
//! successor wave whose results are appended after this one's, which lets
//! later phases be added while the earlier ones are already running.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{KilnError, Result};
use crate::future::Future;

struct ArenaState<T> {
    futures: Vec<Future<T>>,
    frozen: bool,
    chained: Option<Arena<T>>,
}

/// Ordered, joinable, chainable batch of futures
pub struct Arena<T> {
    state: Arc<Mutex<ArenaState<T>>>,
}

impl<T> Clone for Arena<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Arena")
            .field("futures", &state.futures.len())
            .field("frozen", &state.frozen)
            .field("chained", &state.chained.is_some())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Arena<T> {
    /// Create an arena, optionally seeded with the root future of its wave.
    ///
    /// The seed must not already be depended upon by another future.
    pub fn new(seed: Option<Future<T>>) -> Result<Self> {
        let mut futures = Vec::new();
        if let Some(seed) = seed {
            let waiters = seed.waiter_count();
            if waiters != 0 {
                return Err(KilnError::usage(format!(
                    "arena seed future {} already has {} waiter(s)",
                    seed.id(),
                    waiters
                )));
            }
            futures.push(seed);
        }

        Ok(Self::from_futures(futures))
    }

    fn from_futures(futures: Vec<Future<T>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ArenaState {
                futures,
                frozen: false,
                chained: None,
            })),
        }
    }

    /// Append a future to this wave
    pub fn add_future(&self, future: Future<T>) -> Result<()> {
        let mut state = self.state.lock();
        if state.frozen {
            return Err(KilnError::usage(format!(
                "cannot add future {} to an arena that has already been awaited",
                future.id()
            )));
        }
        state.futures.push(future);
        Ok(())
    }

    /// Create and link the successor wave
    pub fn chain(&self) -> Result<Arena<T>> {
        let mut state = self.state.lock();
        if state.frozen {
            return Err(KilnError::usage(
                "cannot chain an arena that has already been awaited",
            ));
        }
        if state.chained.is_some() {
            return Err(KilnError::usage("arena is already chained"));
        }

        let next = Self::from_futures(Vec::new());
        state.chained = Some(next.clone());
        Ok(next)
    }

    /// Freeze the arena and wait for every future, then for the chained wave.
    ///
    /// Outcomes are in insertion order regardless of completion order.
    /// Calling this again returns the same outcomes without re-running anything.
    pub fn await_all(&self) -> Vec<Result<T>> {
        let (futures, chained) = {
            let mut state = self.state.lock();
            state.frozen = true;
            (state.futures.clone(), state.chained.clone())
        };

        let mut results: Vec<Result<T>> = futures.iter().map(Future::await_result).collect();
        if let Some(next) = chained {
            results.extend(next.await_all());
        }
        results
    }

    /// Like [`Arena::await_all`], but yields the first error in insertion order
    pub fn join(&self) -> Result<Vec<T>> {
        self.await_all().into_iter().collect()
    }

    /// Release every future held by this arena and its chain.
    ///
    /// Bodies that are already running are not interrupted.
    pub fn destroy(self) {
        let chained = {
            let mut state = self.state.lock();
            state.frozen = true;
            state.futures.clear();
            state.chained.take()
        };
        if let Some(next) = chained {
            next.destroy();
        }
    }
}

impl<T> Arena<T> {
    /// Number of futures in this wave (chain excluded)
    pub fn len(&self) -> usize {
        self.state.lock().futures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::WorkerPool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_results_follow_insertion_order() {
        let pool = WorkerPool::new(4).unwrap();
        let arena = Arena::new(None).unwrap();

        // Later futures finish first.
        for i in 0..6u64 {
            arena
                .add_future(Future::new(&pool, vec![], move |_| {
                    thread::sleep(Duration::from_millis(60 - i * 10));
                    Ok(i)
                }))
                .unwrap();
        }

        let results = arena.join().unwrap();
        assert_eq!(results, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_chained_results_are_appended() {
        let pool = WorkerPool::new(2).unwrap();
        let first = Arena::new(Some(Future::ready(1))).unwrap();
        let second = first.chain().unwrap();
        second.add_future(Future::new(&pool, vec![], |_| Ok(3))).unwrap();
        first.add_future(Future::ready(2)).unwrap();

        assert_eq!(first.join().unwrap(), vec![1, 2, 3]);
        assert!(second.is_frozen());
    }

    #[test]
    fn test_await_all_is_idempotent() {
        let pool = WorkerPool::new(2).unwrap();
        let arena = Arena::new(None).unwrap();
        arena.add_future(Future::new(&pool, vec![], |_| Ok(10))).unwrap();
        arena
            .add_future(Future::new(&pool, vec![], |_| Err(KilnError::eval("nope"))))
            .unwrap();

        let first: Vec<_> = arena.await_all().into_iter().map(|r| r.ok()).collect();
        let second: Vec<_> = arena.await_all().into_iter().map(|r| r.ok()).collect();
        assert_eq!(first, vec![Some(10), None]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_frozen_arena_rejects_new_work() {
        let arena: Arena<i32> = Arena::new(None).unwrap();
        arena.await_all();

        let err = arena.add_future(Future::ready(1)).unwrap_err();
        assert!(matches!(err, KilnError::Usage { .. }));
        assert!(matches!(arena.chain(), Err(KilnError::Usage { .. })));
    }

    #[test]
    fn test_seed_with_waiters_is_rejected() {
        let pool = WorkerPool::new(1).unwrap();
        let seed: Future<i32> = Future::pending();
        let _dependent = Future::new(&pool, vec![seed.clone()], |args| Ok(args[0]));

        let err = Arena::new(Some(seed)).unwrap_err();
        assert!(matches!(err, KilnError::Usage { .. }));
    }

    #[test]
    fn test_chain_only_once() {
        let arena: Arena<i32> = Arena::new(None).unwrap();
        arena.chain().unwrap();
        assert!(matches!(arena.chain(), Err(KilnError::Usage { .. })));
    }

    #[test]
    fn test_join_reports_first_error_in_order() {
        let arena = Arena::new(None).unwrap();
        arena.add_future(Future::ready(1)).unwrap();
        arena.add_future(Future::failed(KilnError::eval("first"))).unwrap();
        arena.add_future(Future::failed(KilnError::eval("second"))).unwrap();

        let err = arena.join().unwrap_err();
        assert!(matches!(err, KilnError::Eval { ref message } if message == "first"));
    }

    #[test]
    fn test_destroy_does_not_interrupt_running_work() {
        let pool = WorkerPool::new(1).unwrap();
        let arena = Arena::new(None).unwrap();
        let slow = Future::new(&pool, vec![], |_| {
            thread::sleep(Duration::from_millis(30));
            Ok(5)
        });
        arena.add_future(slow.clone()).unwrap();
        arena.chain().unwrap().add_future(Future::ready(6)).unwrap();

        arena.destroy();
        assert_eq!(slow.await_result().unwrap(), 5);
    }
}

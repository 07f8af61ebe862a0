//! Time-windowed memoization with single-flight recomputation
//!
//! `Single::run` hands every caller inside the `wait` window the result of the
//! last completed computation. At most one computation runs at a time; callers
//! that arrive while it is running block and receive its result. Fallible
//! computations store a `Result`, so errors are cached exactly like values.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct State<T> {
    result: Option<T>,
    completed_at: Option<Instant>,
    generation: u64,
}

pub struct Single<T> {
    wait: Duration,
    state: Mutex<State<T>>,
    running: Mutex<()>,
}

impl<T: Clone> Single<T> {
    pub fn new(wait: Duration) -> Self {
        Single {
            wait,
            state: Mutex::new(State {
                result: None,
                completed_at: None,
                generation: 0,
            }),
            running: Mutex::new(()),
        }
    }

    /// Returns `(value, shared)`; `shared` is false only for the caller that ran `f`.
    pub fn run<F>(&self, f: F) -> (T, bool)
    where
        F: FnOnce() -> T,
    {
        let seen = {
            let state = self.state.lock();
            if let (Some(result), Some(at)) = (&state.result, state.completed_at) {
                if at.elapsed() < self.wait {
                    return (result.clone(), true);
                }
            }
            state.generation
        };

        let _running = self.running.lock();

        // a computation finished while we were queued behind it
        {
            let state = self.state.lock();
            if state.generation != seen {
                if let Some(result) = &state.result {
                    return (result.clone(), true);
                }
            }
        }

        let value = f();

        let mut state = self.state.lock();
        state.result = Some(value.clone());
        state.completed_at = Some(Instant::now());
        state.generation = state.generation.wrapping_add(1);
        (value, false)
    }

    /// Force the next `run` to recompute.
    pub fn reset(&self) {
        self.state.lock().completed_at = None;
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_concurrent_callers_share_one_computation() {
        let single = Arc::new(Single::new(Duration::from_secs(5)));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let single = single.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    single.run(|| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        42u32
                    })
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|(v, _)| *v == 42));
        assert_eq!(results.iter().filter(|(_, shared)| !shared).count(), 1);
    }

    #[test]
    fn test_errors_are_cached_like_values() {
        let single: Single<std::result::Result<u32, String>> = Single::new(Duration::from_secs(5));
        let calls = AtomicUsize::new(0);

        let (first, shared) = single.run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("boom".to_string())
        });
        assert_eq!(first, Err("boom".to_string()));
        assert!(!shared);

        let (second, shared) = single.run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        assert_eq!(second, Err("boom".to_string()));
        assert!(shared);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recomputes_after_window() {
        let single = Single::new(Duration::from_millis(20));
        let (v, _) = single.run(|| 1);
        assert_eq!(v, 1);

        thread::sleep(Duration::from_millis(40));
        let (v, shared) = single.run(|| 2);
        assert_eq!(v, 2);
        assert!(!shared);
    }

    #[test]
    fn test_reset_forces_recompute() {
        let single = Single::new(Duration::from_secs(60));
        single.run(|| "old");
        single.reset();
        let (v, shared) = single.run(|| "new");
        assert_eq!(v, "new");
        assert!(!shared);

        let (v, shared) = single.run(|| "newer");
        assert_eq!(v, "new");
        assert!(shared);
    }
}

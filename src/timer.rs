//! One-shot and repeating wake-ups on a worker thread, cancelable.
//!
//! Cancellation is synchronous: once [`TimerHandle::cancel`] returns, the
//! callback is not running and will not run again.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{RangingError, Result};

/// Cancel flag that sleeping workers can wait on.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep up to `timeout`. Returns `true` if cancelled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = flag.lock();
        while !*cancelled {
            if cvar.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

pub struct TimerHandle {
    token: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Stop the timer and wait for an in-progress callback to finish.
    pub fn cancel(mut self) {
        self.shutdown();
    }

    /// True once the worker has nothing left to do.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(|w| w.is_finished())
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!("timer worker panicked");
            }
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn(name: &str, token: CancelToken, body: impl FnOnce() + Send + 'static) -> Result<TimerHandle> {
    let worker = thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| RangingError::Worker(e.to_string()))?;
    Ok(TimerHandle {
        token,
        worker: Some(worker),
    })
}

/// Run `f` once after `delay`, unless cancelled first.
pub fn after<F>(name: &str, delay: Duration, f: F) -> Result<TimerHandle>
where
    F: FnOnce() + Send + 'static,
{
    let token = CancelToken::new();
    let waiter = token.clone();
    spawn(name, token, move || {
        if !waiter.wait_for(delay) {
            f();
        }
    })
}

/// Run `tick` immediately, then again every `period()` measured from the start
/// of the previous tick. The period is re-read after every tick; a zero period
/// or `ControlFlow::Break` ends the timer.
pub fn every<P, F>(name: &str, period: P, mut tick: F) -> Result<TimerHandle>
where
    P: Fn() -> Duration + Send + 'static,
    F: FnMut() -> ControlFlow<()> + Send + 'static,
{
    let token = CancelToken::new();
    let waiter = token.clone();
    let label = name.to_string();
    spawn(name, token, move || {
        loop {
            if waiter.is_cancelled() {
                break;
            }
            let started = Instant::now();
            if tick().is_break() {
                break;
            }
            let period = period();
            if period.is_zero() {
                break;
            }
            if waiter.wait_for(period.saturating_sub(started.elapsed())) {
                break;
            }
        }
        debug!(timer = %label, "timer finished");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || waiter.wait_for(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(10));
        token.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wait_for_times_out() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_for(Duration::from_millis(5)));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_after_fires_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let timer = after("test-after", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        timer.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_after_cancelled_never_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let timer = after("test-after-cancel", Duration::from_secs(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        timer.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_every_repeats_until_cancelled() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);
        let timer = every(
            "test-every",
            || Duration::from_millis(5),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            },
        )
        .unwrap();
        thread::sleep(Duration::from_millis(60));
        timer.cancel();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "only {seen} ticks");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_every_zero_period_runs_once() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);
        let timer = every(
            "test-every-once",
            || Duration::ZERO,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            },
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(timer.is_finished());
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}

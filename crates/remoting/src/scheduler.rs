// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cancellable background tasks.
//!
//! Every lease timer, pinger, validator and callback poller runs on a
//! [`Task`]: one named thread parked on a stop channel with `recv_timeout`.
//! The task body returns the delay until its next run, or `None` to finish.
//!
//! ```text
//!   spawn ──▶ wait(delay) ──timeout──▶ body() ──Some(d)──▶ wait(d) ...
//!                 │                       │
//!              stop/drop               None ──▶ exit
//!                 ▼
//!               exit
//! ```
//!
//! Cancelling never waits for a run in progress, so it is safe from inside
//! the task body and while holding locks the body also takes.

use crate::error::{Error, Result};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Shared {
    cancelled: AtomicBool,
    finished: AtomicBool,
}

/// Handle to a background task. Dropping it cancels the task.
pub struct Task {
    name: String,
    shared: Arc<Shared>,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    /// Spawn a task whose body decides its own next delay.
    pub fn spawn<F>(name: &str, initial_delay: Duration, mut body: F) -> Result<Task>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let shared = Arc::new(Shared {
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        let thread_shared = Arc::clone(&shared);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("remoting-{}", name))
            .spawn(move || {
                let mut delay = initial_delay;
                loop {
                    match stop_rx.recv_timeout(delay) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    if thread_shared.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    match panic::catch_unwind(AssertUnwindSafe(&mut body)) {
                        Ok(Some(next)) => delay = next,
                        Ok(None) => break,
                        Err(_) => {
                            log::error!("[scheduler] task {} panicked, stopping it", thread_name);
                            break;
                        }
                    }
                }
                thread_shared.finished.store(true, Ordering::Release);
                log::trace!("[scheduler] task {} exited", thread_name);
            })
            .map_err(Error::Io)?;

        Ok(Task {
            name: name.to_string(),
            shared,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `body` every `period`, first run one period from now.
    pub fn periodic<F>(name: &str, period: Duration, mut body: F) -> Result<Task>
    where
        F: FnMut() + Send + 'static,
    {
        Self::spawn(name, period, move || {
            body();
            Some(period)
        })
    }

    /// Run `body` once after `delay`.
    pub fn once<F>(name: &str, delay: Duration, body: F) -> Result<Task>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut body = Some(body);
        Self::spawn(name, delay, move || {
            if let Some(f) = body.take() {
                f();
            }
            None
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop future runs. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        drop(self.stop_tx.lock().take());
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// True once the thread has left its loop.
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Cancel and wait for the thread, unless called from the task itself.
    pub fn cancel_and_join(&self) {
        self.cancel();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn periodic_runs_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = Task::periodic("test-periodic", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        task.cancel_and_join();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 3, "ran {} times", seen);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), seen);
        assert!(task.is_finished());
    }

    #[test]
    fn once_fires_a_single_time() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = Task::once("test-once", Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[test]
    fn cancel_before_first_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = Task::once("test-cancel", Duration::from_millis(50), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        task.cancel();
        task.cancel();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn body_controls_next_delay() {
        let started = Instant::now();
        let runs = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&runs);
        let _task = Task::spawn("test-adaptive", Duration::from_millis(5), move || {
            let mut runs = r.lock();
            runs.push(started.elapsed());
            if runs.len() < 2 {
                Some(Duration::from_millis(40))
            } else {
                None
            }
        })
        .unwrap();
        thread::sleep(Duration::from_millis(150));
        let runs = runs.lock();
        assert_eq!(runs.len(), 2);
        assert!(runs[1] - runs[0] >= Duration::from_millis(40));
    }

    #[test]
    fn cancel_from_inside_the_task() {
        let slot: Arc<Mutex<Option<Arc<Task>>>> = Arc::new(Mutex::new(None));
        let s = Arc::clone(&slot);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = Arc::new(
            Task::periodic("test-self-cancel", Duration::from_millis(5), move || {
                c.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = s.lock().as_ref() {
                    me.cancel_and_join();
                }
            })
            .unwrap(),
        );
        *slot.lock() = Some(Arc::clone(&task));
        thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
        slot.lock().take();
    }

    #[test]
    fn panicking_body_is_contained() {
        let task = Task::periodic("test-panic", Duration::from_millis(5), || {
            panic!("boom");
        })
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(task.is_finished());
    }
}

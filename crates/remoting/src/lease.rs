// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side lease for one invoker session.
//!
//! A physical client connection (invoker session) multiplexes any number of
//! logical clients. The server keeps one [`Lease`] per invoker session with
//! one timer; the logical clients ride along as a [`ClientHolder`] snapshot
//! refreshed by every `$PING$`.
//!
//! ```text
//!   created ──start──▶ armed ──ping──▶ armed (deadline = last ping + 2P)
//!                        │
//!          ┌─────────────┴──────────────┐
//!     no ping in 2P                terminate(session)
//!          ▼                             ▼
//!   expired: connection_lost      terminated: connection_terminated
//! ```
//!
//! Both terminal states set `stopped`, which is never cleared.

use crate::error::Result;
use crate::invocation::ClientHolder;
use crate::notifier::ConnectionNotifier;
use crate::scheduler::Task;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Called with the invoker session id once a lease has stopped.
pub type LeaseEndHook = Arc<dyn Fn(&str) + Send + Sync>;

struct LeaseState {
    period: Duration,
    last_update: Instant,
    holders: BTreeMap<String, ClientHolder>,
    last_timestamp: Option<u64>,
    stopped: bool,
}

impl LeaseState {
    fn window(&self) -> Duration {
        self.period * 2
    }
}

/// Keepalive record for one invoker session.
pub struct Lease {
    invoker_session_id: String,
    use_client_identity: bool,
    notifier: Arc<ConnectionNotifier>,
    state: Mutex<LeaseState>,
    timer: Mutex<Option<Task>>,
    on_end: Option<LeaseEndHook>,
}

impl Lease {
    pub fn new(
        invoker_session_id: impl Into<String>,
        period: Duration,
        use_client_identity: bool,
        notifier: Arc<ConnectionNotifier>,
        on_end: Option<LeaseEndHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            invoker_session_id: invoker_session_id.into(),
            use_client_identity,
            notifier,
            state: Mutex::new(LeaseState {
                period,
                last_update: Instant::now(),
                holders: BTreeMap::new(),
                last_timestamp: None,
                stopped: false,
            }),
            timer: Mutex::new(None),
            on_end,
        })
    }

    pub fn invoker_session_id(&self) -> &str {
        &self.invoker_session_id
    }

    /// Arm the timer.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let window = {
            let mut state = self.state.lock();
            state.last_update = Instant::now();
            state.window()
        };
        log::debug!(
            "[lease] {} started, window {:?}",
            self.invoker_session_id,
            window
        );
        self.schedule(window)
    }

    fn schedule(self: &Arc<Self>, first_check: Duration) -> Result<()> {
        let weak: Weak<Lease> = Arc::downgrade(self);
        let task = Task::spawn(
            &format!("lease-{}", short_id(&self.invoker_session_id)),
            first_check,
            move || weak.upgrade().and_then(|lease| lease.check_expiry()),
        )?;
        if let Some(old) = self.timer.lock().replace(task) {
            old.cancel();
        }
        Ok(())
    }

    /// Timer body: expire when the window has elapsed, else sleep until it would.
    fn check_expiry(&self) -> Option<Duration> {
        let holders = {
            let mut state = self.state.lock();
            if state.stopped {
                return None;
            }
            let deadline = state.last_update + state.window();
            let now = Instant::now();
            if now < deadline {
                return Some(deadline - now);
            }
            state.stopped = true;
            std::mem::take(&mut state.holders)
        };

        log::warn!(
            "[lease] {} expired, {} client(s) lost",
            self.invoker_session_id,
            holders.len()
        );
        for holder in holders.values() {
            self.notifier.connection_lost(holder);
        }
        self.ended();
        None
    }

    /// Apply a ping.
    ///
    /// Returns false if the lease has already stopped; the caller then needs a
    /// new lease. With client identity, a snapshot older than the last applied
    /// one is ignored but still counts as liveness.
    pub fn update_lease(
        self: &Arc<Self>,
        period: Option<Duration>,
        holders: Option<Vec<ClientHolder>>,
        timestamp: Option<u64>,
    ) -> bool {
        let reschedule = {
            let mut state = self.state.lock();
            if state.stopped {
                return false;
            }
            state.last_update = Instant::now();

            let stale = self.use_client_identity
                && matches!((state.last_timestamp, timestamp), (Some(last), Some(ts)) if ts < last);
            if stale {
                log::debug!(
                    "[lease] {} ignoring stale client list (timestamp {:?} < {:?})",
                    self.invoker_session_id,
                    timestamp,
                    state.last_timestamp
                );
            } else {
                if let Some(holders) = holders {
                    state.holders = holders
                        .into_iter()
                        .map(|h| (h.session_id.clone(), h))
                        .collect();
                }
                if timestamp.is_some() {
                    state.last_timestamp = timestamp;
                }
            }

            match period {
                Some(p) if !p.is_zero() && p != state.period => {
                    log::debug!(
                        "[lease] {} period {:?} -> {:?}",
                        self.invoker_session_id,
                        state.period,
                        p
                    );
                    state.period = p;
                    Some(state.window())
                }
                _ => None,
            }
        };

        if let Some(window) = reschedule {
            if let Err(e) = self.schedule(window) {
                log::error!(
                    "[lease] {} could not reschedule timer: {}",
                    self.invoker_session_id,
                    e
                );
            }
        }
        true
    }

    /// End the whole lease (own invoker session id) or one client.
    pub fn terminate_lease(&self, session_id: &str) {
        if session_id == self.invoker_session_id {
            let holders = {
                let mut state = self.state.lock();
                if state.stopped {
                    return;
                }
                state.stopped = true;
                std::mem::take(&mut state.holders)
            };
            if let Some(task) = self.timer.lock().take() {
                task.cancel();
            }
            log::debug!(
                "[lease] {} terminated, {} client(s) disconnected",
                self.invoker_session_id,
                holders.len()
            );
            for holder in holders.values() {
                self.notifier.connection_terminated(holder);
            }
            self.ended();
        } else {
            let removed = {
                let mut state = self.state.lock();
                if state.stopped {
                    return;
                }
                state.holders.remove(session_id)
            };
            match removed {
                Some(holder) => {
                    log::debug!(
                        "[lease] {} client {} disconnected",
                        self.invoker_session_id,
                        session_id
                    );
                    self.notifier.connection_terminated(&holder);
                }
                None => log::debug!(
                    "[lease] {} has no client {}",
                    self.invoker_session_id,
                    session_id
                ),
            }
        }
    }

    fn ended(&self) {
        if let Some(hook) = &self.on_end {
            hook(&self.invoker_session_id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn period(&self) -> Duration {
        self.state.lock().period
    }

    pub fn holders(&self) -> Vec<ClientHolder> {
        self.state.lock().holders.values().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().holders.len()
    }

    pub fn has_client(&self, session_id: &str) -> bool {
        self.state.lock().holders.contains_key(session_id)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(task) = self.timer.get_mut().take() {
            task.cancel();
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Lease")
            .field("invoker_session_id", &self.invoker_session_id)
            .field("period", &state.period)
            .field("clients", &state.holders.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::notifier::ConnectionListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Counts {
        lost: AtomicUsize,
        terminated: AtomicUsize,
    }

    impl ConnectionListener for Counts {
        fn handle_connection_exception(&self, cause: Option<&Error>, _client: &ClientHolder) {
            match cause {
                None => self.lost.fetch_add(1, Ordering::SeqCst),
                Some(_) => self.terminated.fetch_add(1, Ordering::SeqCst),
            };
        }
    }

    fn setup(period_ms: u64, identity: bool) -> (Arc<Lease>, Arc<Counts>) {
        let notifier = Arc::new(ConnectionNotifier::new());
        let counts = Arc::new(Counts::default());
        notifier.add_listener(counts.clone());
        let lease = Lease::new(
            "invoker-session-1",
            Duration::from_millis(period_ms),
            identity,
            notifier,
            None,
        );
        (lease, counts)
    }

    fn holders(ids: &[&str]) -> Vec<ClientHolder> {
        ids.iter()
            .map(|id| ClientHolder::new(*id, Duration::from_millis(100), Config::new()))
            .collect()
    }

    #[test]
    fn refresh_extends_the_window() {
        let (lease, counts) = setup(100, false);
        lease.start().unwrap();
        lease.update_lease(None, Some(holders(&["a"])), None);

        thread::sleep(Duration::from_millis(50));
        assert!(lease.update_lease(None, None, None));

        // Deadline is now 50 + 200 ms after start.
        thread::sleep(Duration::from_millis(170));
        assert!(!lease.is_stopped());
        assert_eq!(counts.lost.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(150));
        assert!(lease.is_stopped());
        assert_eq!(counts.lost.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expiry_fires_once_per_client() {
        let (lease, counts) = setup(20, false);
        lease.start().unwrap();
        lease.update_lease(None, Some(holders(&["a", "b"])), None);
        thread::sleep(Duration::from_millis(150));
        assert!(lease.is_stopped());
        assert_eq!(counts.lost.load(Ordering::SeqCst), 2);

        assert!(!lease.update_lease(None, Some(holders(&["c"])), None));
        lease.terminate_lease("invoker-session-1");
        assert_eq!(counts.terminated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stale_snapshot_still_counts_as_liveness() {
        let (lease, _counts) = setup(1000, true);
        lease.start().unwrap();
        lease.update_lease(None, Some(holders(&["a", "b"])), Some(10));
        lease.update_lease(None, Some(holders(&["a"])), Some(5));
        assert_eq!(lease.client_count(), 2);

        lease.update_lease(None, Some(holders(&["c"])), Some(11));
        assert_eq!(lease.client_count(), 1);
        assert!(lease.has_client("c"));
    }

    #[test]
    fn without_identity_order_is_not_enforced() {
        let (lease, _counts) = setup(1000, false);
        lease.start().unwrap();
        lease.update_lease(None, Some(holders(&["a", "b"])), Some(10));
        lease.update_lease(None, Some(holders(&["a"])), Some(5));
        assert_eq!(lease.client_count(), 1);
    }

    #[test]
    fn terminate_single_client_keeps_lease() {
        let (lease, counts) = setup(1000, false);
        lease.start().unwrap();
        lease.update_lease(None, Some(holders(&["a", "b"])), None);

        lease.terminate_lease("a");
        assert!(!lease.is_stopped());
        assert_eq!(lease.client_count(), 1);
        assert_eq!(counts.terminated.load(Ordering::SeqCst), 1);

        lease.terminate_lease("invoker-session-1");
        lease.terminate_lease("invoker-session-1");
        assert!(lease.is_stopped());
        assert_eq!(counts.terminated.load(Ordering::SeqCst), 2);
        assert_eq!(counts.lost.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn period_change_reschedules() {
        let (lease, counts) = setup(5000, false);
        lease.start().unwrap();
        lease.update_lease(Some(Duration::from_millis(20)), Some(holders(&["a"])), None);
        assert_eq!(lease.period(), Duration::from_millis(20));
        thread::sleep(Duration::from_millis(150));
        assert!(lease.is_stopped());
        assert_eq!(counts.lost.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn end_hook_runs_on_expiry() {
        let ended = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&ended);
        let lease = Lease::new(
            "s-1",
            Duration::from_millis(10),
            false,
            Arc::new(ConnectionNotifier::new()),
            Some(Arc::new(move |id: &str| e.lock().push(id.to_string()))),
        );
        lease.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(*ended.lock(), vec!["s-1".to_string()]);
    }
}

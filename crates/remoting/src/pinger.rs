// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side lease pinger.
//!
//! One pinger per client invoker. Every logical client sharing the invoker
//! registers a [`ClientHolder`]; each `$PING$` carries the whole snapshot and
//! a strictly increasing timestamp. The ping period is the smallest lease
//! period among registered clients.
//!
//! A failed periodic ping is only logged: the server-side lease alone decides
//! when the client is gone.

use crate::config::{Config, DisconnectTimeout};
use crate::error::{Error, Result};
use crate::invocation::{meta, ClientHolder, Command, InvocationRequest};
use crate::invoker::ClientInvoker;
use crate::lease::short_id;
use crate::scheduler::Task;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

struct PingerState {
    clients: BTreeMap<String, ClientHolder>,
    period: Duration,
    disconnect_timeout: DisconnectTimeout,
}

impl PingerState {
    fn min_period(&self) -> Option<Duration> {
        self.clients.values().map(ClientHolder::lease_period).min()
    }
}

/// Periodic liveness proof for one client invoker.
pub struct LeasePinger {
    invoker: Weak<ClientInvoker>,
    invoker_session_id: String,
    lease_pinger_id: String,
    state: Mutex<PingerState>,
    timer: Mutex<Option<Task>>,
    timestamp: AtomicU64,
}

impl LeasePinger {
    pub fn new(
        invoker: Weak<ClientInvoker>,
        invoker_session_id: String,
        disconnect_timeout: DisconnectTimeout,
    ) -> Arc<Self> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Arc::new(Self {
            invoker,
            invoker_session_id,
            lease_pinger_id: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(PingerState {
                clients: BTreeMap::new(),
                period: Duration::ZERO,
                disconnect_timeout,
            }),
            timer: Mutex::new(None),
            timestamp: AtomicU64::new(seed),
        })
    }

    pub fn lease_pinger_id(&self) -> &str {
        &self.lease_pinger_id
    }

    pub fn invoker_session_id(&self) -> &str {
        &self.invoker_session_id
    }

    pub fn ping_period(&self) -> Duration {
        self.state.lock().period
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn set_disconnect_timeout(&self, timeout: DisconnectTimeout) {
        self.state.lock().disconnect_timeout = timeout;
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Register a logical client and ping once, synchronously.
    ///
    /// A failed ping unregisters the client again and is returned. A zero
    /// period is not a lease and is rejected.
    pub fn add_client(
        self: &Arc<Self>,
        session_id: &str,
        config: &Config,
        lease_period: Duration,
    ) -> Result<()> {
        if lease_period.is_zero() {
            return Err(Error::Configuration(format!(
                "client {} asked for a zero lease period",
                session_id
            )));
        }
        let shrunk = {
            let mut state = self.state.lock();
            state.clients.insert(
                session_id.to_string(),
                ClientHolder::new(session_id, lease_period, config.clone()),
            );
            let old = state.period;
            state.period = state.min_period().unwrap_or(lease_period);
            old.is_zero() || state.period < old
        };

        if let Err(e) = self.send_ping() {
            log::warn!(
                "[pinger] {} initial ping for client {} failed: {}",
                short_id(&self.lease_pinger_id),
                session_id,
                e
            );
            let mut state = self.state.lock();
            state.clients.remove(session_id);
            if let Some(p) = state.min_period() {
                state.period = p;
            }
            return Err(e);
        }

        if shrunk && self.is_running() {
            self.start_ping()?;
        }
        Ok(())
    }

    /// Unregister a client; returns whether it was the last one.
    ///
    /// The last client's teardown travels with the connection-scoped
    /// `$DISCONNECT$` sent by [`stop_ping`](Self::stop_ping).
    pub fn remove_client(self: &Arc<Self>, session_id: &str) -> bool {
        let (removed, last, grew, timeout, remaining) = {
            let mut state = self.state.lock();
            let removed = state.clients.remove(session_id).is_some();
            let last = state.clients.is_empty();
            let old = state.period;
            if let Some(p) = state.min_period() {
                state.period = p;
            }
            let remaining: Vec<ClientHolder> = state.clients.values().cloned().collect();
            (removed, last, state.period > old, state.disconnect_timeout, remaining)
        };

        if removed && !last && !timeout.skips_network() {
            let request = self
                .request(Command::Disconnect, &remaining, timeout)
                .map(|r| r.with_meta(meta::CLIENT_SESSION_ID, session_id));
            if let Err(e) = request.and_then(|r| self.send(r)) {
                log::debug!(
                    "[pinger] disconnect notice for client {} failed: {}",
                    session_id,
                    e
                );
            }
        }

        if grew && !last && self.is_running() {
            if let Err(e) = self.start_ping() {
                log::error!("[pinger] could not restart timer: {}", e);
            }
        }
        last
    }

    /// Start or restart the periodic ping at the current period.
    pub fn start_ping(self: &Arc<Self>) -> Result<()> {
        let period = self.ping_period();
        let weak = Arc::downgrade(self);
        let task = Task::spawn(
            &format!("lease-pinger-{}", short_id(&self.lease_pinger_id)),
            period,
            move || {
                let pinger = weak.upgrade()?;
                if let Err(e) = pinger.send_ping() {
                    log::warn!(
                        "[pinger] {} ping failed: {}",
                        short_id(&pinger.lease_pinger_id),
                        e
                    );
                }
                Some(pinger.ping_period())
            },
        )?;
        if let Some(old) = self.timer.lock().replace(task) {
            old.cancel();
        }
        log::trace!(
            "[pinger] {} pinging every {:?}",
            short_id(&self.lease_pinger_id),
            period
        );
        Ok(())
    }

    /// Stop pinging and send the final connection-scoped `$DISCONNECT$`.
    /// Idempotent.
    pub fn stop_ping(&self) {
        let Some(task) = self.timer.lock().take() else {
            return;
        };
        task.cancel();

        let (timeout, holders) = {
            let state = self.state.lock();
            (
                state.disconnect_timeout,
                state.clients.values().cloned().collect::<Vec<_>>(),
            )
        };
        if timeout.skips_network() {
            log::debug!(
                "[pinger] {} stopped without disconnect",
                short_id(&self.lease_pinger_id)
            );
            return;
        }
        let result = self
            .request(Command::Disconnect, &holders, timeout)
            .and_then(|r| self.send(r));
        match result {
            Ok(()) => log::debug!(
                "[pinger] {} stopped, lease {} disconnected",
                short_id(&self.lease_pinger_id),
                self.invoker_session_id
            ),
            Err(e) => log::debug!(
                "[pinger] {} final disconnect failed: {}",
                short_id(&self.lease_pinger_id),
                e
            ),
        }
    }

    fn send_ping(&self) -> Result<()> {
        let holders: Vec<ClientHolder> = self.state.lock().clients.values().cloned().collect();
        let request = self.request(Command::Ping, &holders, DisconnectTimeout::TransportDefault)?;
        self.send(request)
    }

    fn request(
        &self,
        command: Command,
        holders: &[ClientHolder],
        timeout: DisconnectTimeout,
    ) -> Result<InvocationRequest> {
        let ts = self.timestamp.fetch_add(1, Ordering::SeqCst) + 1;
        let mut request = InvocationRequest::new(self.invoker_session_id.clone(), command)
            .with_meta(meta::CLIENT_HOLDERS, ClientHolder::encode_list(holders)?)
            .with_meta(meta::LEASE_PERIOD, self.ping_period().as_millis())
            .with_meta(meta::TIME_STAMP, ts)
            .with_meta(meta::LEASE_PINGER_ID, &self.lease_pinger_id);
        if let Some(t) = timeout.per_call() {
            request = request.with_timeout(t);
        }
        Ok(request)
    }

    fn send(&self, request: InvocationRequest) -> Result<()> {
        let invoker = self.invoker.upgrade().ok_or(Error::NotConnected)?;
        invoker.invoke(request)?.into_result().map(|_| ())
    }
}

impl Drop for LeasePinger {
    fn drop(&mut self) {
        if let Some(task) = self.timer.get_mut().take() {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::InvocationResponse;
    use crate::invoker::testing::{count_commands, invoker_over, ScriptedTransport};
    use std::thread;

    fn pinger_for(invoker: &Arc<ClientInvoker>, timeout: DisconnectTimeout) -> Arc<LeasePinger> {
        LeasePinger::new(
            Arc::downgrade(invoker),
            invoker.session_id().to_string(),
            timeout,
        )
    }

    #[test]
    fn last_client_gets_exactly_one_final_disconnect() {
        let (transport, requests) = ScriptedTransport::leasing(1000);
        let invoker = invoker_over(transport);
        let pinger = pinger_for(&invoker, DisconnectTimeout::TransportDefault);
        pinger
            .add_client("only", &Config::new(), Duration::from_millis(1000))
            .unwrap();
        pinger.start_ping().unwrap();

        assert!(pinger.remove_client("only"));
        pinger.stop_ping();
        pinger.stop_ping();

        assert_eq!(count_commands(&requests, Command::Disconnect), 1);
        let reqs = requests.lock();
        let last = reqs.last().unwrap();
        assert!(last.meta(meta::CLIENT_SESSION_ID).is_none());
        assert_eq!(last.session_id, invoker.session_id());
    }

    #[test]
    fn zero_disconnect_timeout_skips_network() {
        let (transport, requests) = ScriptedTransport::leasing(1000);
        let invoker = invoker_over(transport);
        let pinger = pinger_for(&invoker, DisconnectTimeout::TransportDefault);
        pinger
            .add_client("a", &Config::new(), Duration::from_millis(1000))
            .unwrap();
        pinger
            .add_client("b", &Config::new(), Duration::from_millis(1000))
            .unwrap();
        pinger.start_ping().unwrap();
        let before = requests.lock().len();

        pinger.set_disconnect_timeout(DisconnectTimeout::SkipNetwork);
        assert!(!pinger.remove_client("a"));
        assert!(pinger.remove_client("b"));
        pinger.stop_ping();
        assert_eq!(requests.lock().len(), before);
    }

    #[test]
    fn failed_initial_ping_rejects_client() {
        let (transport, _requests) = ScriptedTransport::new(|_req| {
            Err(Error::cannot_connect("test://scripted:1", "refused"))
        });
        let invoker = invoker_over(transport);
        let pinger = pinger_for(&invoker, DisconnectTimeout::TransportDefault);
        let err = pinger
            .add_client("a", &Config::new(), Duration::from_millis(100))
            .unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(pinger.client_count(), 0);
    }

    #[test]
    fn zero_period_rejected_without_touching_schedule() {
        let (transport, requests) = ScriptedTransport::leasing(1000);
        let invoker = invoker_over(transport);
        let pinger = pinger_for(&invoker, DisconnectTimeout::SkipNetwork);
        pinger
            .add_client("a", &Config::new(), Duration::from_millis(500))
            .unwrap();
        let sent = requests.lock().len();

        let err = pinger.add_client("b", &Config::new(), Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(pinger.client_count(), 1);
        assert_eq!(pinger.ping_period(), Duration::from_millis(500));
        assert_eq!(requests.lock().len(), sent);
    }

    #[test]
    fn period_tracks_smallest_client() {
        let (transport, _requests) = ScriptedTransport::leasing(1000);
        let invoker = invoker_over(transport);
        let pinger = pinger_for(&invoker, DisconnectTimeout::SkipNetwork);
        pinger
            .add_client("slow", &Config::new(), Duration::from_millis(800))
            .unwrap();
        pinger
            .add_client("fast", &Config::new(), Duration::from_millis(200))
            .unwrap();
        assert_eq!(pinger.ping_period(), Duration::from_millis(200));
        assert!(!pinger.remove_client("fast"));
        assert_eq!(pinger.ping_period(), Duration::from_millis(800));
    }

    #[test]
    fn periodic_pings_carry_increasing_timestamps_and_survive_failures() {
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = Arc::clone(&fail);
        let (transport, requests) = ScriptedTransport::new(move |req| {
            if f.load(Ordering::SeqCst) {
                return Err(Error::Transport("wire cut".into()));
            }
            Ok(InvocationResponse::value(req.session_id.clone(), serde_json::Value::Null))
        });
        let invoker = invoker_over(transport);
        let pinger = pinger_for(&invoker, DisconnectTimeout::SkipNetwork);
        pinger
            .add_client("a", &Config::new(), Duration::from_millis(20))
            .unwrap();
        pinger.start_ping().unwrap();

        thread::sleep(Duration::from_millis(70));
        fail.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        fail.store(false, Ordering::SeqCst);
        let seen_at_recovery = requests.lock().len();
        thread::sleep(Duration::from_millis(70));
        pinger.stop_ping();

        let reqs = requests.lock();
        assert!(reqs.len() > seen_at_recovery, "pinger died after failures");
        let stamps: Vec<u64> = reqs
            .iter()
            .filter_map(|r| r.meta(meta::TIME_STAMP))
            .map(|s| s.parse().unwrap())
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        let holders = ClientHolder::decode_list(reqs[0].meta(meta::CLIENT_HOLDERS).unwrap()).unwrap();
        assert_eq!(holders[0].session_id, "a");
    }
}

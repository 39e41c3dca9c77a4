// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side connection validator.
//!
//! Every `validatorPingPeriod` a `$PING$` is sent on a short-lived thread
//! while the periodic thread waits up to `validatorPingTimeout` for it:
//!
//! ```text
//!   tick ──▶ spawn ping ──▶ wait(timeout) ──ok──▶ next tick
//!                               │
//!                          late / failed
//!                               ▼
//!        stop timer, force-stop lease pinger, notify every (listener, client)
//! ```
//!
//! Failure is terminal: each registered pair is told exactly once and the
//! validator never pings again. Clients sharing an invoker and metadata share
//! one validator through [`ValidatorTable`].

use crate::config::{keys, Config, DEFAULT_VALIDATOR_PING_PERIOD, DEFAULT_VALIDATOR_PING_TIMEOUT};
use crate::error::{Error, Result};
use crate::invocation::{meta, ClientHolder, Command, InvocationRequest};
use crate::invoker::ClientInvoker;
use crate::lease::short_id;
use crate::notifier::{listener_key, ConnectionListener};
use crate::scheduler::Task;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

struct Registration {
    listener: Arc<dyn ConnectionListener>,
    clients: Vec<ClientHolder>,
}

#[derive(Default)]
struct ValidatorState {
    listeners: Vec<Registration>,
    stopped: bool,
}

/// Periodic health check of one client invoker.
pub struct ConnectionValidator {
    invoker: Weak<ClientInvoker>,
    invoker_session_id: String,
    metadata: Config,
    ping_period: Duration,
    ping_timeout: Duration,
    tie_to_lease: bool,
    stop_lease_on_failure: bool,
    state: Mutex<ValidatorState>,
    timer: Mutex<Option<Task>>,
}

impl ConnectionValidator {
    /// Validator for `invoker`; options come from `metadata`, then from the
    /// invoker's configuration.
    pub fn new(invoker: &Arc<ClientInvoker>, metadata: &Config) -> Arc<Self> {
        let lookup = |key: &str| -> Config {
            if metadata.contains(key) {
                metadata.clone()
            } else {
                invoker.config().clone()
            }
        };
        let ping_period = lookup(keys::VALIDATOR_PING_PERIOD)
            .get_millis(keys::VALIDATOR_PING_PERIOD)
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_VALIDATOR_PING_PERIOD);
        let ping_timeout = lookup(keys::VALIDATOR_PING_TIMEOUT)
            .get_millis(keys::VALIDATOR_PING_TIMEOUT)
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_VALIDATOR_PING_TIMEOUT);

        Arc::new(Self {
            invoker: Arc::downgrade(invoker),
            invoker_session_id: invoker.session_id().to_string(),
            metadata: metadata.clone(),
            ping_period,
            ping_timeout,
            tie_to_lease: lookup(keys::TIE_TO_LEASE).get_bool(keys::TIE_TO_LEASE, true),
            stop_lease_on_failure: lookup(keys::STOP_LEASE_ON_FAILURE)
                .get_bool(keys::STOP_LEASE_ON_FAILURE, true),
            state: Mutex::new(ValidatorState::default()),
            timer: Mutex::new(None),
        })
    }

    pub fn invoker_session_id(&self) -> &str {
        &self.invoker_session_id
    }

    pub fn metadata(&self) -> &Config {
        &self.metadata
    }

    pub fn ping_period(&self) -> Duration {
        self.ping_period
    }

    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    /// Begin periodic validation.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let period = self.ping_period;
        let task = Task::spawn(
            &format!("validator-{}", short_id(&self.invoker_session_id)),
            period,
            move || {
                let validator = weak.upgrade()?;
                if validator.is_stopped() {
                    return None;
                }
                if validator.check_connection() {
                    Some(period)
                } else {
                    validator.connection_failed();
                    None
                }
            },
        )?;
        if let Some(old) = self.timer.lock().replace(task) {
            old.cancel();
        }
        log::debug!(
            "[validator] {} started (period {:?}, timeout {:?})",
            short_id(&self.invoker_session_id),
            self.ping_period,
            self.ping_timeout
        );
        Ok(())
    }

    /// Register `client` under `listener`. False once the validator is
    /// stopping; the caller then needs a fresh validator.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>, client: ClientHolder) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            return false;
        }
        let key = listener_key(&listener);
        match state
            .listeners
            .iter_mut()
            .find(|r| listener_key(&r.listener) == key)
        {
            Some(reg) => {
                if !reg.clients.iter().any(|c| c.session_id == client.session_id) {
                    reg.clients.push(client);
                }
            }
            None => state.listeners.push(Registration {
                listener,
                clients: vec![client],
            }),
        }
        true
    }

    /// Unregister one (listener, client) pair; returns whether it was there.
    pub fn remove_listener(
        &self,
        listener: &Arc<dyn ConnectionListener>,
        client_session_id: &str,
    ) -> bool {
        let mut state = self.state.lock();
        let key = listener_key(listener);
        let Some(idx) = state
            .listeners
            .iter()
            .position(|r| listener_key(&r.listener) == key)
        else {
            return false;
        };
        let reg = &mut state.listeners[idx];
        let before = reg.clients.len();
        reg.clients.retain(|c| c.session_id != client_session_id);
        let removed = reg.clients.len() != before;
        if reg.clients.is_empty() {
            state.listeners.remove(idx);
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Stop validating without notifying anyone. Idempotent; true only for
    /// the call that actually stopped it.
    pub fn stop(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return false;
            }
            state.stopped = true;
            state.listeners.clear();
        }
        if let Some(task) = self.timer.lock().take() {
            task.cancel();
        }
        log::debug!(
            "[validator] {} stopped",
            short_id(&self.invoker_session_id)
        );
        true
    }

    /// One ping raced against the timeout.
    pub fn check_connection(&self) -> bool {
        let Some(invoker) = self.invoker.upgrade() else {
            return false;
        };
        let tied = self.tie_to_lease && invoker.lease_pinger().is_some();
        let done = Arc::new((Mutex::new(None::<bool>), Condvar::new()));

        let signal = Arc::clone(&done);
        let spawned = thread::Builder::new()
            .name("remoting-validator-ping".into())
            .spawn(move || {
                let ok = ping(&invoker, tied);
                let (lock, cvar) = &*signal;
                *lock.lock() = Some(ok);
                cvar.notify_all();
            });
        if let Err(e) = spawned {
            log::error!("[validator] could not spawn ping thread: {}", e);
            return false;
        }

        let deadline = Instant::now() + self.ping_timeout;
        let (lock, cvar) = &*done;
        let mut result = lock.lock();
        while result.is_none() {
            if cvar.wait_until(&mut result, deadline).timed_out() {
                break;
            }
        }
        let ok = result.unwrap_or(false);
        if !ok {
            log::warn!(
                "[validator] {} ping failed or took longer than {:?}",
                short_id(&self.invoker_session_id),
                self.ping_timeout
            );
        }
        ok
    }

    /// Terminal failure. Only the first of this and [`stop`](Self::stop)
    /// takes effect; returns whether this call did.
    fn connection_failed(&self) -> bool {
        let registrations = {
            let mut state = self.state.lock();
            if state.stopped {
                return false;
            }
            state.stopped = true;
            std::mem::take(&mut state.listeners)
        };
        if let Some(task) = self.timer.lock().take() {
            task.cancel();
        }

        let invoker = self.invoker.upgrade();
        if self.stop_lease_on_failure {
            if let Some(invoker) = &invoker {
                invoker.force_stop_lease();
            }
        }
        let target = invoker.map_or_else(
            || self.invoker_session_id.clone(),
            |i| i.locator().to_string(),
        );

        for reg in registrations {
            for client in reg.clients {
                let listener = Arc::clone(&reg.listener);
                let cause = Error::cannot_connect(&target, "connection validation failed");
                let spawned = thread::Builder::new()
                    .name("remoting-validator-notify".into())
                    .spawn(move || listener.handle_connection_exception(Some(&cause), &client));
                if let Err(e) = spawned {
                    log::error!("[validator] could not spawn notifier thread: {}", e);
                }
            }
        }
        true
    }
}

impl Drop for ConnectionValidator {
    fn drop(&mut self) {
        if let Some(task) = self.timer.get_mut().take() {
            task.cancel();
        }
    }
}

fn ping(invoker: &ClientInvoker, tied: bool) -> bool {
    let request = InvocationRequest::new(invoker.session_id().to_string(), Command::Ping)
        .with_meta(meta::INVOKER_SESSION_ID, invoker.session_id());
    match invoker.invoke(request).and_then(|r| r.into_result()) {
        Ok(Value::Bool(alive)) if tied => alive,
        Ok(_) if tied => false,
        Ok(_) => true,
        Err(e) => {
            log::debug!("[validator] ping to {} failed: {}", invoker.locator(), e);
            false
        }
    }
}

// ============================================================================
// Shared table
// ============================================================================

type ValidatorKey = (String, Config);

struct ValidatorEntry {
    validator: Arc<ConnectionValidator>,
    refs: usize,
}

/// Validators shared by (invoker session, metadata), reference counted.
#[derive(Default)]
pub struct ValidatorTable {
    entries: Mutex<HashMap<ValidatorKey, ValidatorEntry>>,
}

impl ValidatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach (`listener`, `client`) to the validator for (`invoker`,
    /// `metadata`), creating or replacing it as needed.
    pub fn attach(
        &self,
        invoker: &Arc<ClientInvoker>,
        metadata: &Config,
        listener: Arc<dyn ConnectionListener>,
        client: ClientHolder,
    ) -> Result<Arc<ConnectionValidator>> {
        let key = (invoker.session_id().to_string(), metadata.clone());
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            if entry.validator.add_listener(Arc::clone(&listener), client.clone()) {
                entry.refs += 1;
                return Ok(Arc::clone(&entry.validator));
            }
            log::debug!(
                "[validator] {} is stopping, replacing it",
                short_id(invoker.session_id())
            );
        }

        let validator = ConnectionValidator::new(invoker, metadata);
        validator.add_listener(listener, client);
        validator.start()?;
        entries.insert(
            key,
            ValidatorEntry {
                validator: Arc::clone(&validator),
                refs: 1,
            },
        );
        Ok(validator)
    }

    /// Undo one [`attach`](Self::attach). The last reference stops the
    /// validator and drops the entry.
    pub fn detach(
        &self,
        validator: &Arc<ConnectionValidator>,
        listener: &Arc<dyn ConnectionListener>,
        client_session_id: &str,
    ) {
        validator.remove_listener(listener, client_session_id);
        let key = (
            validator.invoker_session_id().to_string(),
            validator.metadata().clone(),
        );
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&key) else {
            return;
        };
        if !Arc::ptr_eq(&entry.validator, validator) {
            // Replaced after a failure; the old one is already stopped.
            return;
        }
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = entries.remove(&key) {
                entry.validator.stop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection loss fan-out.

use crate::error::Error;
use crate::invocation::ClientHolder;
use parking_lot::Mutex;
use std::sync::Arc;

/// Receives connection failures and planned disconnects.
///
/// `cause` is `None` when a lease expired without a ping,
/// `Some(Error::ClientDisconnected)` for a planned disconnect, and a
/// connectivity error when a client-side validator gave up.
pub trait ConnectionListener: Send + Sync {
    fn handle_connection_exception(&self, cause: Option<&Error>, client: &ClientHolder);
}

impl<F> ConnectionListener for F
where
    F: Fn(Option<&Error>, &ClientHolder) + Send + Sync,
{
    fn handle_connection_exception(&self, cause: Option<&Error>, client: &ClientHolder) {
        self(cause, client)
    }
}

/// Identity of a listener: the address of its allocation.
pub(crate) fn listener_key(listener: &Arc<dyn ConnectionListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

/// Ordered listener list notified from a snapshot.
#[derive(Default)]
pub struct ConnectionNotifier {
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
}

impl ConnectionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append; returns false if the listener is already registered.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let key = listener_key(&listener);
        if listeners.iter().any(|l| listener_key(l) == key) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Insert ahead of every existing listener.
    pub fn add_listener_first(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let key = listener_key(&listener);
        if listeners.iter().any(|l| listener_key(l) == key) {
            return false;
        }
        listeners.insert(0, listener);
        true
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let key = listener_key(listener);
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| listener_key(l) != key);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Lease expired: cause is absent.
    pub fn connection_lost(&self, client: &ClientHolder) {
        log::debug!("[notifier] connection lost for client {}", client.session_id);
        self.notify(None, client);
    }

    /// Client disconnected on purpose.
    pub fn connection_terminated(&self, client: &ClientHolder) {
        log::debug!(
            "[notifier] connection terminated for client {}",
            client.session_id
        );
        self.notify(Some(&Error::ClientDisconnected), client);
    }

    fn notify(&self, cause: Option<&Error>, client: &ClientHolder) {
        let snapshot: Vec<Arc<dyn ConnectionListener>> = self.listeners.lock().clone();
        for listener in snapshot {
            listener.handle_connection_exception(cause, client);
        }
    }
}

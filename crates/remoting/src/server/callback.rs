// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side handle for sending callbacks to one client listener.
//!
//! Push mode owns an internal [`Client`] to the listener's callback locator
//! and delivers each callback synchronously as `HANDLECALLBACK`. Pull mode
//! queues callbacks until the client drains them with `GETCALLBACKS`.

use crate::client::Client;
use crate::config::Config;
use crate::context::RemotingContext;
use crate::error::{Error, Result};
use crate::invocation::{Callback, InternalInvocation};
use crate::locator::Locator;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Told when a client acknowledged a callback.
pub trait CallbackAckListener: Send + Sync {
    fn acknowledged(&self, callback: &Callback, response: Option<&Value>);
}

impl<F> CallbackAckListener for F
where
    F: Fn(&Callback, Option<&Value>) + Send + Sync,
{
    fn acknowledged(&self, callback: &Callback, response: Option<&Value>) {
        self(callback, response)
    }
}

/// Callback sink for one (client session, listener id).
pub struct ServerInvokerCallbackHandler {
    client_session_id: String,
    listener_id: String,
    callback_locator: Option<Locator>,
    server_locator: Locator,
    context: Weak<RemotingContext>,
    push_client: Mutex<Option<Client>>,
    queue: Mutex<VecDeque<Callback>>,
    awaiting_ack: Mutex<HashMap<String, (Callback, Arc<dyn CallbackAckListener>)>>,
    destroyed: AtomicBool,
}

impl ServerInvokerCallbackHandler {
    pub(crate) fn new(
        client_session_id: &str,
        listener_id: &str,
        callback_locator: Option<Locator>,
        server_locator: Locator,
        context: Weak<RemotingContext>,
    ) -> Self {
        Self {
            client_session_id: client_session_id.to_string(),
            listener_id: listener_id.to_string(),
            callback_locator,
            server_locator,
            context,
            push_client: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            awaiting_ack: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Table key for (client session, listener id).
    pub(crate) fn key(client_session_id: &str, listener_id: &str) -> String {
        format!("{}+{}", client_session_id, listener_id)
    }

    pub fn client_session_id(&self) -> &str {
        &self.client_session_id
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    pub fn callback_locator(&self) -> Option<&Locator> {
        self.callback_locator.as_ref()
    }

    pub fn is_pull(&self) -> bool {
        self.callback_locator.is_none()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Open the push connection to the callback locator.
    pub(crate) fn connect(&self) -> Result<()> {
        let Some(locator) = &self.callback_locator else {
            return Ok(());
        };
        let context = self
            .context
            .upgrade()
            .ok_or_else(|| Error::InvalidState("remoting context is gone".into()))?;
        let client = Client::new(context, locator, Config::new())?;
        client.connect()?;
        log::debug!(
            "[callback] push client for listener {} connected to {}",
            self.listener_id,
            locator
        );
        let mut slot = self.push_client.lock();
        if self.destroyed.load(Ordering::Acquire) {
            drop(slot);
            client.set_disconnect_timeout(crate::config::DisconnectTimeout::SkipNetwork);
            client.disconnect();
            return Err(Error::InvalidState(format!(
                "listener {} removed while connecting",
                self.listener_id
            )));
        }
        *slot = Some(client);
        Ok(())
    }

    fn stamp(&self, mut callback: Callback) -> Callback {
        callback.listener_id = self.listener_id.clone();
        if callback.server_locator.is_none() {
            callback.server_locator = Some(self.server_locator.clone());
        }
        callback
    }

    /// Deliver (push) or queue (pull) one callback.
    pub fn handle_callback(&self, callback: Callback) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::InvalidState(format!(
                "callback handler for listener {} is destroyed",
                self.listener_id
            )));
        }
        let callback = self.stamp(callback);
        if self.is_pull() {
            self.queue.lock().push_back(callback);
            return Ok(());
        }
        self.push(callback)
    }

    /// Like [`handle_callback`](Self::handle_callback), asking for an
    /// acknowledgement. Push callbacks are acknowledged once delivered; pull
    /// callbacks when the client acknowledges them. Returns the callback id.
    pub fn handle_callback_acked(
        &self,
        callback: Callback,
        listener: Arc<dyn CallbackAckListener>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut callback = callback;
        callback.callback_id = Some(id.clone());
        let callback = self.stamp(callback);

        if self.is_pull() {
            if self.is_destroyed() {
                return Err(Error::InvalidState("callback handler is destroyed".into()));
            }
            self.awaiting_ack
                .lock()
                .insert(id.clone(), (callback.clone(), listener));
            self.queue.lock().push_back(callback);
            return Ok(id);
        }

        self.push(callback.clone())?;
        listener.acknowledged(&callback, None);
        Ok(id)
    }

    fn push(&self, callback: Callback) -> Result<()> {
        let guard = self.push_client.lock();
        let client = guard.as_ref().ok_or(Error::NotConnected)?;
        client
            .invoke_internal(InternalInvocation::HandleCallback { callback }, None)
            .map(|_| ())
    }

    /// Drain queued pull callbacks.
    pub fn get_callbacks(&self) -> Vec<Callback> {
        self.queue.lock().drain(..).collect()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.queue.lock().len()
    }

    /// Client acknowledged `callback_ids`; `responses` pair up by position.
    pub fn acknowledge(&self, callback_ids: &[String], responses: Option<&[Value]>) -> usize {
        let mut acked = 0;
        for (i, id) in callback_ids.iter().enumerate() {
            let entry = self.awaiting_ack.lock().remove(id);
            match entry {
                Some((callback, listener)) => {
                    listener.acknowledged(&callback, responses.and_then(|r| r.get(i)));
                    acked += 1;
                }
                None => log::debug!("[callback] unknown callback id {} acknowledged", id),
            }
        }
        acked
    }

    /// Drop the push connection and queued callbacks. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let client = self.push_client.lock().take();
        if let Some(client) = client {
            client.set_disconnect_timeout(crate::config::DisconnectTimeout::SkipNetwork);
            client.disconnect();
        }
        self.queue.lock().clear();
        self.awaiting_ack.lock().clear();
        log::debug!(
            "[callback] handler for client {} listener {} destroyed",
            self.client_session_id,
            self.listener_id
        );
    }
}

impl std::fmt::Debug for ServerInvokerCallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInvokerCallbackHandler")
            .field("client_session_id", &self.client_session_id)
            .field("listener_id", &self.listener_id)
            .field("callback_locator", &self.callback_locator)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

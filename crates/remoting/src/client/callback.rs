// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side callback delivery.

use crate::error::{Error, Result};
use crate::invocation::{Callback, InternalInvocation, InvocationRequest, RemoteFault};
use crate::invoker::ClientInvoker;
use crate::lease::short_id;
use crate::scheduler::Task;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Receives server-to-client callbacks.
pub trait CallbackHandler: Send + Sync {
    fn handle_callback(&self, callback: &Callback) -> std::result::Result<(), RemoteFault>;
}

impl<F> CallbackHandler for F
where
    F: Fn(&Callback) -> std::result::Result<(), RemoteFault> + Send + Sync,
{
    fn handle_callback(&self, callback: &Callback) -> std::result::Result<(), RemoteFault> {
        self(callback)
    }
}

/// Identity of a handler: the address of its allocation.
pub(crate) fn handler_key(handler: &Arc<dyn CallbackHandler>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

/// Where a listener's internal requests go.
#[derive(Clone)]
pub(crate) struct ListenerRoute {
    pub invoker: Weak<ClientInvoker>,
    pub session_id: String,
    pub subsystem: Option<String>,
    pub listener_id: String,
}

impl ListenerRoute {
    pub fn send(
        &self,
        internal: InternalInvocation,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let invoker = self.invoker.upgrade().ok_or(Error::NotConnected)?;
        let mut request = InvocationRequest::new(self.session_id.clone(), internal)
            .with_subsystem(self.subsystem.clone());
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }
        invoker.invoke(request)?.into_result()
    }

    /// `GETCALLBACKS` for this listener.
    pub fn fetch(&self) -> Result<Vec<Callback>> {
        let value = self.send(
            InternalInvocation::GetCallbacks {
                listener_id: self.listener_id.clone(),
            },
            None,
        )?;
        Ok(serde_json::from_value(value)?)
    }

    /// `ACKNOWLEDGECALLBACK` for this listener; returns how many callbacks
    /// the server knew about.
    pub fn acknowledge(
        &self,
        callback_ids: Vec<String>,
        responses: Option<Vec<serde_json::Value>>,
    ) -> Result<usize> {
        self.send(
            InternalInvocation::AcknowledgeCallback {
                listener_id: self.listener_id.clone(),
                callback_ids,
                responses,
            },
            None,
        )
        .map(|acked| acked.as_u64().unwrap_or(0) as usize)
    }
}

/// Background `GETCALLBACKS` loop for one pull listener.
///
/// Delivered callbacks that asked for an acknowledgement are acknowledged in
/// one batch per poll.
pub(crate) struct CallbackPoller {
    task: Task,
}

impl CallbackPoller {
    pub fn start(
        route: ListenerRoute,
        handler: Arc<dyn CallbackHandler>,
        period: Duration,
    ) -> Result<Self> {
        let name = format!("callback-poller-{}", short_id(&route.listener_id));
        let task = Task::periodic(&name, period, move || poll_once(&route, handler.as_ref()))?;
        log::debug!("[poller] {} polling every {:?}", name, period);
        Ok(Self { task })
    }

    pub fn stop(&self) {
        self.task.cancel();
    }
}

impl Drop for CallbackPoller {
    fn drop(&mut self) {
        self.task.cancel();
    }
}

fn poll_once(route: &ListenerRoute, handler: &dyn CallbackHandler) {
    let callbacks = match route.fetch() {
        Ok(callbacks) => callbacks,
        Err(e) => {
            log::warn!(
                "[poller] GETCALLBACKS for listener {} failed: {}",
                route.listener_id,
                e
            );
            return;
        }
    };
    if callbacks.is_empty() {
        return;
    }

    let mut acks = Vec::new();
    for callback in &callbacks {
        match handler.handle_callback(callback) {
            Ok(()) => {
                if let Some(id) = &callback.callback_id {
                    acks.push(id.clone());
                }
            }
            Err(fault) => log::warn!(
                "[poller] handler for listener {} failed: {}",
                route.listener_id,
                fault.message
            ),
        }
    }
    log::trace!(
        "[poller] delivered {} callback(s) to listener {}",
        callbacks.len(),
        route.listener_id
    );

    if !acks.is_empty() {
        if let Err(e) = route.acknowledge(acks, None) {
            log::warn!(
                "[poller] acknowledgement for listener {} failed: {}",
                route.listener_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{InvocationResponse, Payload};
    use crate::invoker::testing::{invoker_over, ScriptedTransport};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler<F>(f: F) -> Arc<dyn CallbackHandler>
    where
        F: Fn(&Callback) -> std::result::Result<(), RemoteFault> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[test]
    fn handler_identity_follows_allocation() {
        let a = handler(|_| Ok(()));
        let b = handler(|_| Ok(()));
        assert_eq!(handler_key(&a), handler_key(&Arc::clone(&a)));
        assert_ne!(handler_key(&a), handler_key(&b));
    }

    #[test]
    fn poller_delivers_and_acknowledges() {
        let served = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&served);
        let (transport, requests) = ScriptedTransport::new(move |req| {
            let value = match &req.payload {
                Payload::Internal(InternalInvocation::GetCallbacks { .. })
                    if s.fetch_add(1, Ordering::SeqCst) == 0 =>
                {
                    let mut acked = Callback::new(json!(1));
                    acked.callback_id = Some("cb-1".into());
                    serde_json::to_value(vec![acked, Callback::new(json!(2))])?
                }
                Payload::Internal(InternalInvocation::GetCallbacks { .. }) => json!([]),
                _ => json!(null),
            };
            Ok(InvocationResponse::value(req.session_id.clone(), value))
        });
        let invoker = invoker_over(transport);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = handler(move |cb| {
            sink.lock().push(cb.payload.clone());
            Ok(())
        });

        let route = ListenerRoute {
            invoker: Arc::downgrade(&invoker),
            session_id: "client".into(),
            subsystem: None,
            listener_id: "l-1".into(),
        };
        let poller = CallbackPoller::start(route, handler, Duration::from_millis(20)).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        poller.stop();

        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
        let acks: Vec<Vec<String>> = requests
            .lock()
            .iter()
            .filter_map(|r| match &r.payload {
                Payload::Internal(InternalInvocation::AcknowledgeCallback {
                    callback_ids, ..
                }) => Some(callback_ids.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![vec!["cb-1".to_string()]]);
    }
}

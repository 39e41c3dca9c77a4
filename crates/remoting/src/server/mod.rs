// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server invoker: request router for one bound locator.
//!
//! ```text
//!   request ──▶ started? ──no──▶ InvalidState fault
//!                  │
//!                  ├─ $PING$ / $DISCONNECT$ / $GET_CLIENT_LOCAL_ADDRESS$ / $ECHO$
//!                  ├─ oneway ──▶ worker pool, empty answer right away
//!                  ├─ internal (ADDLISTENER, GETCALLBACKS, ...) ──▶ callback tables
//!                  └─ data ──▶ subsystem handler (or the only one registered)
//! ```
//!
//! The invoker also owns the lease table: one [`Lease`] per client invoker
//! session, created by the first `$PING$` once leasing is enabled
//! (`clientLeasePeriod > 0` and a connection listener registered).

pub mod callback;

pub use callback::{CallbackAckListener, ServerInvokerCallbackHandler};

use crate::client::CallbackHandler;
use crate::config::{keys, Config, DEFAULT_ONEWAY_QUEUE_SIZE, DEFAULT_ONEWAY_THREADS};
use crate::context::RemotingContext;
use crate::error::{Error, Result};
use crate::invocation::{
    meta, Callback, ClientHolder, Command, InternalInvocation, InvocationRequest,
    InvocationResponse, Payload, PingResponse, RemoteFault,
};
use crate::invoker::ServerTransport;
use crate::lease::{Lease, LeaseEndHook};
use crate::locator::Locator;
use crate::notifier::{ConnectionListener, ConnectionNotifier};
use crate::worker_pool::WorkerPool;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Application side of a server invoker.
pub trait ServerInvocationHandler: Send + Sync {
    fn invoke(&self, request: &InvocationRequest) -> std::result::Result<Value, RemoteFault>;

    /// A client registered a callback listener.
    fn add_listener(&self, _callback: Arc<ServerInvokerCallbackHandler>) {}

    fn remove_listener(&self, _callback: &Arc<ServerInvokerCallbackHandler>) {}

    /// A client offered a stream served at `stream`.
    fn handle_stream(
        &self,
        _stream: &Locator,
        _payload: &Value,
    ) -> std::result::Result<Value, RemoteFault> {
        Err(RemoteFault::application("handler does not accept streams"))
    }
}

impl<F> ServerInvocationHandler for F
where
    F: Fn(&InvocationRequest) -> std::result::Result<Value, RemoteFault> + Send + Sync,
{
    fn invoke(&self, request: &InvocationRequest) -> std::result::Result<Value, RemoteFault> {
        self(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Created,
    Started,
    Stopped,
    Destroyed,
}

/// Client-local handler registered on a callback server.
struct ClientListener {
    handler: Arc<dyn CallbackHandler>,
    handle_object: Option<Value>,
}

type LeaseTable = Arc<Mutex<HashMap<String, Arc<Lease>>>>;

/// Dispatches requests arriving on one server transport.
pub struct ServerInvoker {
    self_ref: Weak<ServerInvoker>,
    context: Weak<RemotingContext>,
    locator: RwLock<Locator>,
    config: Config,
    transport: Box<dyn ServerTransport>,
    state: Mutex<ServerState>,
    handlers: RwLock<HashMap<String, Arc<dyn ServerInvocationHandler>>>,
    notifier: Arc<ConnectionNotifier>,
    user_listeners: AtomicUsize,
    leases: LeaseTable,
    callback_handlers: DashMap<String, Arc<ServerInvokerCallbackHandler>>,
    client_listeners: DashMap<String, ClientListener>,
    oneway_pool: Mutex<Option<Arc<WorkerPool>>>,
}

impl ServerInvoker {
    pub fn new(
        locator: Locator,
        config: Config,
        transport: Box<dyn ServerTransport>,
        context: Weak<RemotingContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ServerInvoker>| {
            let notifier = Arc::new(ConnectionNotifier::new());
            let cleanup = weak.clone();
            let internal: Arc<dyn ConnectionListener> =
                Arc::new(move |_cause: Option<&Error>, client: &ClientHolder| {
                    if let Some(invoker) = cleanup.upgrade() {
                        invoker.destroy_callback_handlers_of(&client.session_id);
                    }
                });
            notifier.add_listener_first(internal);

            Self {
                self_ref: weak.clone(),
                context,
                locator: RwLock::new(locator),
                config,
                transport,
                state: Mutex::new(ServerState::Created),
                handlers: RwLock::new(HashMap::new()),
                notifier,
                user_listeners: AtomicUsize::new(0),
                leases: Arc::new(Mutex::new(HashMap::new())),
                callback_handlers: DashMap::new(),
                client_listeners: DashMap::new(),
                oneway_pool: Mutex::new(None),
            }
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the transport; returns the resolved locator. Idempotent while
    /// started.
    pub fn start(self: &Arc<Self>) -> Result<Locator> {
        let mut state = self.state.lock();
        match *state {
            ServerState::Created => {}
            ServerState::Started => return Ok(self.locator()),
            other => {
                return Err(Error::InvalidState(format!(
                    "server invoker {} cannot start from {:?}",
                    self.locator(),
                    other
                )))
            }
        }

        let resolved = self.transport.start(Arc::clone(self))?;
        *self.locator.write() = resolved.clone();
        *state = ServerState::Started;
        drop(state);

        if let Some(ctx) = self.context.upgrade() {
            ctx.registry().register_server_locator(&resolved);
        }
        log::info!("[server] invoker started on {}", resolved);
        Ok(resolved)
    }

    /// Stop serving. Leases are dropped without notification and callback
    /// handlers are destroyed.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != ServerState::Started {
                if *state == ServerState::Created {
                    *state = ServerState::Stopped;
                }
                return;
            }
            *state = ServerState::Stopped;
        }
        self.transport.stop();

        let leases: Vec<Arc<Lease>> = self.leases.lock().drain().map(|(_, l)| l).collect();
        drop(leases);
        let handlers: Vec<Arc<ServerInvokerCallbackHandler>> = self
            .callback_handlers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.callback_handlers.clear();
        for handler in handlers {
            handler.destroy();
        }
        self.client_listeners.clear();
        if let Some(pool) = self.oneway_pool.lock().take() {
            pool.shutdown();
        }
        log::info!("[server] invoker on {} stopped", self.locator());
    }

    /// Stop and forget every handler. Final.
    pub fn destroy(&self) {
        self.stop();
        *self.state.lock() = ServerState::Destroyed;
        self.handlers.write().clear();
        log::debug!("[server] invoker on {} destroyed", self.locator());
    }

    pub fn is_started(&self) -> bool {
        *self.state.lock() == ServerState::Started
    }

    pub fn is_destroyed(&self) -> bool {
        *self.state.lock() == ServerState::Destroyed
    }

    /// Locator served, with the real port once started.
    pub fn locator(&self) -> Locator {
        self.locator.read().clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ========================================================================
    // Handlers and listeners
    // ========================================================================

    /// Register `handler` for `subsystem` (case-insensitive); returns the
    /// handler it replaced.
    pub fn add_invocation_handler(
        &self,
        subsystem: &str,
        handler: Arc<dyn ServerInvocationHandler>,
    ) -> Option<Arc<dyn ServerInvocationHandler>> {
        self.handlers
            .write()
            .insert(subsystem.to_ascii_uppercase(), handler)
    }

    pub fn remove_invocation_handler(
        &self,
        subsystem: &str,
    ) -> Option<Arc<dyn ServerInvocationHandler>> {
        self.handlers.write().remove(&subsystem.to_ascii_uppercase())
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        let added = self.notifier.add_listener(listener);
        if added {
            self.user_listeners.fetch_add(1, Ordering::AcqRel);
        }
        added
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let removed = self.notifier.remove_listener(listener);
        if removed {
            self.user_listeners.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    fn client_lease_period(&self) -> Duration {
        self.config
            .get_millis(keys::CLIENT_LEASE_PERIOD)
            .unwrap_or(Duration::ZERO)
    }

    /// Leasing needs a positive `clientLeasePeriod` and someone to tell.
    pub fn is_leasing_enabled(&self) -> bool {
        !self.client_lease_period().is_zero() && self.user_listeners.load(Ordering::Acquire) > 0
    }

    pub fn lease(&self, invoker_session_id: &str) -> Option<Arc<Lease>> {
        self.leases.lock().get(invoker_session_id).cloned()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.lock().len()
    }

    pub fn callback_handler(
        &self,
        client_session_id: &str,
        listener_id: &str,
    ) -> Option<Arc<ServerInvokerCallbackHandler>> {
        self.callback_handlers
            .get(&ServerInvokerCallbackHandler::key(client_session_id, listener_id))
            .map(|e| Arc::clone(e.value()))
    }

    pub fn callback_handler_count(&self) -> usize {
        self.callback_handlers.len()
    }

    pub fn client_listener_count(&self) -> usize {
        self.client_listeners.len()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Handle one request. Failures come back as fault responses.
    pub fn invoke(&self, request: InvocationRequest) -> InvocationResponse {
        let session_id = request.session_id.clone();
        let return_metadata = request.return_metadata.clone();
        let mut response = match self.dispatch(request) {
            Ok(value) => InvocationResponse::value(session_id, value),
            Err(fault) => {
                log::debug!("[server] {} answering with fault: {}", self.locator(), fault.message);
                InvocationResponse::fault(
                    session_id,
                    fault.with_frame(format!("ServerInvoker[{}]", self.locator())),
                )
            }
        };
        response.return_metadata = return_metadata;
        response
    }

    fn dispatch(&self, request: InvocationRequest) -> std::result::Result<Value, RemoteFault> {
        if !self.is_started() {
            return Err(Error::InvalidState(format!(
                "server invoker {} is not started",
                self.locator()
            ))
            .into());
        }

        if let Some(command) = request.payload.as_command() {
            return self.handle_command(command, &request).map_err(RemoteFault::from);
        }

        if request.is_oneway() {
            return self.dispatch_oneway(request).map_err(RemoteFault::from);
        }
        if let Payload::Internal(internal) = &request.payload {
            return self
                .handle_internal(internal, &request)
                .map_err(RemoteFault::from);
        }

        let handler = self.handler_for(request.subsystem.as_deref())?;
        handler
            .invoke(&request)
            .map_err(|f| f.with_subsystem(request.subsystem.clone()))
    }

    fn handler_for(&self, subsystem: Option<&str>) -> Result<Arc<dyn ServerInvocationHandler>> {
        let handlers = self.handlers.read();
        match subsystem {
            Some(name) => handlers
                .get(&name.to_ascii_uppercase())
                .cloned()
                .ok_or_else(|| Error::NoHandler(Some(name.to_string()))),
            None if handlers.len() == 1 => handlers
                .values()
                .next()
                .cloned()
                .ok_or(Error::NoHandler(None)),
            None => Err(Error::NoHandler(None)),
        }
    }

    fn handle_command(&self, command: Command, request: &InvocationRequest) -> Result<Value> {
        match command {
            Command::Ping => self.handle_ping(request),
            Command::Disconnect => {
                self.handle_disconnect(request);
                Ok(Value::Null)
            }
            Command::GetClientLocalAddress => Ok(request
                .peer_address
                .map_or(Value::Null, |addr| Value::String(addr.ip().to_string()))),
            Command::Echo => Ok(serde_json::to_value(&request.request_metadata)?),
        }
    }

    fn handle_ping(&self, request: &InvocationRequest) -> Result<Value> {
        if let Some(id) = request.meta(meta::INVOKER_SESSION_ID) {
            let alive = self.lease(id).is_some_and(|lease| !lease.is_stopped());
            return Ok(Value::Bool(alive));
        }

        let enabled = self.is_leasing_enabled();
        let default_period = self.client_lease_period();
        let period = request
            .meta(meta::LEASE_PERIOD)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        let holders = request
            .meta(meta::CLIENT_HOLDERS)
            .map(ClientHolder::decode_list)
            .transpose()?;
        let timestamp = request
            .meta(meta::TIME_STAMP)
            .and_then(|v| v.parse::<u64>().ok());

        let (lease, created) = {
            let mut leases = self.leases.lock();
            match leases.get(&request.session_id) {
                Some(lease) if !lease.is_stopped() => (Some(Arc::clone(lease)), false),
                _ if enabled => {
                    let lease = Lease::new(
                        request.session_id.clone(),
                        period.unwrap_or(default_period),
                        self.config
                            .get_bool(keys::USE_CLIENT_CONNECTION_IDENTITY, false),
                        Arc::clone(&self.notifier),
                        Some(self.lease_end_hook()),
                    );
                    leases.insert(request.session_id.clone(), Arc::clone(&lease));
                    (Some(lease), true)
                }
                _ => (None, false),
            }
        };

        if let Some(lease) = lease {
            if created {
                log::debug!(
                    "[server] new lease for invoker session {}",
                    request.session_id
                );
                lease.start()?;
            }
            if !lease.update_lease(period, holders, timestamp) {
                log::debug!(
                    "[server] lease {} stopped while being refreshed",
                    request.session_id
                );
            }
        }

        Ok(serde_json::to_value(PingResponse {
            leasing_enabled: enabled,
            lease_period_ms: default_period.as_millis() as u64,
        })?)
    }

    /// Drop a stopped lease from the table, unless a fresh one replaced it.
    fn lease_end_hook(&self) -> LeaseEndHook {
        let leases: Weak<Mutex<HashMap<String, Arc<Lease>>>> = Arc::downgrade(&self.leases);
        Arc::new(move |session_id: &str| {
            let Some(leases) = leases.upgrade() else {
                return;
            };
            let mut leases = leases.lock();
            if leases.get(session_id).is_some_and(|l| l.is_stopped()) {
                leases.remove(session_id);
            }
        })
    }

    fn handle_disconnect(&self, request: &InvocationRequest) {
        let Some(lease) = self.lease(&request.session_id) else {
            log::debug!(
                "[server] disconnect from {} without a lease",
                request.session_id
            );
            return;
        };
        match request.meta(meta::CLIENT_SESSION_ID) {
            Some(client) => lease.terminate_lease(client),
            None => lease.terminate_lease(&request.session_id),
        }
    }

    fn dispatch_oneway(&self, request: InvocationRequest) -> Result<Value> {
        let mut inner = request;
        let Payload::Oneway(payload) = std::mem::replace(&mut inner.payload, Payload::Data(Value::Null))
        else {
            return Ok(Value::Null);
        };
        inner.payload = *payload;

        let pool = self.oneway_pool()?;
        let invoker = self.self_ref.clone();
        pool.submit(move || {
            let Some(invoker) = invoker.upgrade() else {
                return;
            };
            let response = invoker.invoke(inner);
            if let crate::invocation::ResponseBody::Fault(fault) = response.result {
                log::warn!("[server] oneway invocation failed: {}", fault.message);
            }
        })?;
        Ok(Value::Null)
    }

    fn oneway_pool(&self) -> Result<Arc<WorkerPool>> {
        let mut slot = self.oneway_pool.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(WorkerPool::new(
            "server-oneway",
            self.config
                .get_usize(keys::MAX_NUM_THREADS_ONEWAY, DEFAULT_ONEWAY_THREADS),
            self.config
                .get_usize(keys::MAX_ONEWAY_QUEUE_SIZE, DEFAULT_ONEWAY_QUEUE_SIZE),
        )?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    // ========================================================================
    // Internal invocations
    // ========================================================================

    fn handle_internal(
        &self,
        internal: &InternalInvocation,
        request: &InvocationRequest,
    ) -> Result<Value> {
        log::trace!(
            "[server] {} from session {}",
            internal.method(),
            request.session_id
        );
        let client_id = request.session_id.as_str();
        match internal {
            InternalInvocation::AddListener {
                listener_id,
                callback_locator,
            } => self.add_callback_handler(request, listener_id, callback_locator.clone()),
            InternalInvocation::RemoveListener { listener_id } => {
                self.remove_callback_handler(request, listener_id);
                Ok(Value::Null)
            }
            InternalInvocation::GetCallbacks { listener_id } => {
                let handler = self.require_callback_handler(client_id, listener_id)?;
                Ok(serde_json::to_value(handler.get_callbacks())?)
            }
            InternalInvocation::AcknowledgeCallback {
                listener_id,
                callback_ids,
                responses,
            } => {
                let handler = self.require_callback_handler(client_id, listener_id)?;
                if let Some(r) = responses {
                    if r.len() != callback_ids.len() {
                        return Err(Error::Validation(format!(
                            "{} responses for {} callbacks",
                            r.len(),
                            callback_ids.len()
                        )));
                    }
                }
                let acked = handler.acknowledge(callback_ids, responses.as_deref());
                Ok(Value::from(acked))
            }
            InternalInvocation::AddClientListener {
                listener_id,
                handle_object,
                handler,
            } => {
                let handler = handler.0.clone().ok_or_else(|| {
                    Error::Configuration(
                        "client listeners can only be registered in-process".into(),
                    )
                })?;
                self.client_listeners.insert(
                    listener_id.clone(),
                    ClientListener {
                        handler,
                        handle_object: handle_object.clone(),
                    },
                );
                Ok(Value::Null)
            }
            InternalInvocation::RemoveClientListener { listener_id } => {
                if self.client_listeners.remove(listener_id).is_none() {
                    log::debug!("[server] no client listener {}", listener_id);
                }
                Ok(Value::Null)
            }
            InternalInvocation::AddStreamCallback {
                stream_locator,
                payload,
            } => {
                let handler = self.handler_for(request.subsystem.as_deref())?;
                handler
                    .handle_stream(stream_locator, payload)
                    .map_err(Error::RemoteApplication)
            }
            InternalInvocation::HandleCallback { callback } => {
                self.deliver_to_client_listener(callback)?;
                Ok(Value::Null)
            }
            InternalInvocation::Echo { value } => Ok(value.clone()),
        }
    }

    fn add_callback_handler(
        &self,
        request: &InvocationRequest,
        listener_id: &str,
        callback_locator: Option<Locator>,
    ) -> Result<Value> {
        let subsystem_handler = self.handler_for(request.subsystem.as_deref())?;
        let key = ServerInvokerCallbackHandler::key(&request.session_id, listener_id);
        let handler = match self.callback_handlers.entry(key.clone()) {
            Entry::Occupied(_) => {
                log::debug!("[server] listener {} already registered", listener_id);
                return Ok(Value::Null);
            }
            Entry::Vacant(slot) => {
                let handler = Arc::new(ServerInvokerCallbackHandler::new(
                    &request.session_id,
                    listener_id,
                    callback_locator,
                    self.locator(),
                    self.context.clone(),
                ));
                slot.insert(Arc::clone(&handler));
                handler
            }
        };

        // Reserved above; subsystem handlers only see it once connected.
        if let Err(e) = handler.connect() {
            self.callback_handlers
                .remove_if(&key, |_, kept| Arc::ptr_eq(kept, &handler));
            handler.destroy();
            return Err(e);
        }
        if handler.is_destroyed() {
            return Ok(Value::Null);
        }
        subsystem_handler.add_listener(Arc::clone(&handler));
        log::debug!(
            "[server] {} listener {} registered for client {}",
            if handler.is_pull() { "pull" } else { "push" },
            listener_id,
            request.session_id
        );
        Ok(Value::Null)
    }

    fn remove_callback_handler(&self, request: &InvocationRequest, listener_id: &str) {
        let key = ServerInvokerCallbackHandler::key(&request.session_id, listener_id);
        let Some((_, handler)) = self.callback_handlers.remove(&key) else {
            log::debug!("[server] no listener {} to remove", listener_id);
            return;
        };
        if let Ok(subsystem_handler) = self.handler_for(request.subsystem.as_deref()) {
            subsystem_handler.remove_listener(&handler);
        }
        handler.destroy();
    }

    fn require_callback_handler(
        &self,
        client_session_id: &str,
        listener_id: &str,
    ) -> Result<Arc<ServerInvokerCallbackHandler>> {
        self.callback_handler(client_session_id, listener_id)
            .ok_or_else(|| {
                Error::InvalidState(format!("no callback listener {} registered", listener_id))
            })
    }

    fn deliver_to_client_listener(&self, callback: &Callback) -> Result<()> {
        let (handler, handle_object) = {
            let entry = self
                .client_listeners
                .get(&callback.listener_id)
                .ok_or_else(|| {
                    Error::InvalidState(format!(
                        "no client listener {} on {}",
                        callback.listener_id,
                        self.locator()
                    ))
                })?;
            (Arc::clone(&entry.handler), entry.handle_object.clone())
        };
        let mut callback = callback.clone();
        if callback.handle_object.is_none() {
            callback.handle_object = handle_object;
        }
        handler
            .handle_callback(&callback)
            .map_err(Error::RemoteApplication)
    }

    /// Lost or terminated client: its callback handlers go away.
    fn destroy_callback_handlers_of(&self, client_session_id: &str) {
        let doomed: Vec<String> = self
            .callback_handlers
            .iter()
            .filter(|e| e.value().client_session_id() == client_session_id)
            .map(|e| e.key().clone())
            .collect();
        for key in doomed {
            if let Some((_, handler)) = self.callback_handlers.remove(&key) {
                for subsystem_handler in self.handlers.read().values() {
                    subsystem_handler.remove_listener(&handler);
                }
                handler.destroy();
            }
        }
    }
}

impl std::fmt::Debug for ServerInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInvoker")
            .field("locator", &self.locator())
            .field("state", &*self.state.lock())
            .field("handlers", &self.handler_count())
            .field("leases", &self.lease_count())
            .finish()
    }
}

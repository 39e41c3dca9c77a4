// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client facade.
//!
//! A [`Client`] is one logical session against a server locator. It borrows a
//! shared [`ClientInvoker`] from the registry on [`connect`](Client::connect),
//! joins the invoker's lease when `enableLease` is set, and returns the
//! invoker on [`disconnect`](Client::disconnect) (or drop).
//!
//! Callback listeners come in three flavours:
//!
//! - **push, bidirectional**: the transport names a callback locator; a
//!   callback connector is started there and shared by every push listener
//!   of this client that lands on the same locator.
//! - **push, server-to-client**: same, at the `callbackLocator` metadata value
//!   or an ephemeral port on the server's protocol.
//! - **pull**: the server queues callbacks and a poller drains them.

pub mod callback;

pub use callback::CallbackHandler;

use crate::config::{
    keys, Config, DisconnectTimeout, DEFAULT_CALLBACK_POLL_PERIOD, DEFAULT_LEASE_PERIOD,
    DEFAULT_ONEWAY_QUEUE_SIZE, DEFAULT_ONEWAY_THREADS,
};
use crate::connector::Connector;
use crate::context::RemotingContext;
use crate::error::{Error, Result};
use crate::invocation::{
    Callback, ClientHolder, Command, InternalInvocation, InvocationRequest, LocalHandler, Metadata,
    Payload,
};
use crate::invoker::ClientInvoker;
use crate::locator::Locator;
use crate::notifier::{listener_key, ConnectionListener};
use crate::validator::ConnectionValidator;
use crate::worker_pool::WorkerPool;
use callback::{handler_key, CallbackPoller, ListenerRoute};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

enum ListenerMode {
    /// Delivered through the callback connector registered under this
    /// requested locator.
    Push { connector: Locator },
    Pull { poller: CallbackPoller },
}

struct CallbackListener {
    handler: Arc<dyn CallbackHandler>,
    route: ListenerRoute,
    mode: ListenerMode,
}

/// Callback server plus the internal client used to register handlers on it.
struct CallbackConnector {
    connector: Connector,
    client: Arc<Client>,
    resolved: Locator,
    listeners: usize,
}

struct ValidatorLink {
    validator: Arc<ConnectionValidator>,
    listener: Arc<dyn ConnectionListener>,
}

#[derive(Default)]
struct ClientState {
    invoker: Option<Arc<ClientInvoker>>,
    /// Lease period in use; `None` when this client is not on a lease.
    lease_period: Option<Duration>,
    disconnect_timeout: Option<DisconnectTimeout>,
    listeners: Vec<CallbackListener>,
    connectors: HashMap<Locator, CallbackConnector>,
    validators: Vec<ValidatorLink>,
}

/// One logical client session.
pub struct Client {
    context: Arc<RemotingContext>,
    locator: Locator,
    config: Config,
    session_id: String,
    subsystem: Option<String>,
    state: Mutex<ClientState>,
    /// Serializes listener registration and removal.
    listener_ops: Mutex<()>,
    connect_ops: Mutex<()>,
    oneway_pool: Mutex<Option<Arc<WorkerPool>>>,
}

impl Client {
    /// Client for `locator`. `config` is merged with the locator parameters.
    pub fn new(context: Arc<RemotingContext>, locator: &Locator, config: Config) -> Result<Self> {
        if !context.registry().is_transport_registered(locator.protocol()) {
            return Err(Error::UnknownProtocol(locator.protocol().to_string()));
        }
        let config = Config::resolve(locator.parameters(), &config);
        Ok(Self {
            context,
            locator: locator.clone(),
            config,
            session_id: uuid::Uuid::new_v4().to_string(),
            subsystem: None,
            state: Mutex::new(ClientState::default()),
            listener_ops: Mutex::new(()),
            connect_ops: Mutex::new(()),
            oneway_pool: Mutex::new(None),
        })
    }

    /// Route every invocation to the handler registered for `subsystem`.
    #[must_use]
    pub fn with_subsystem(mut self, subsystem: &str) -> Self {
        self.subsystem = Some(subsystem.to_string());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }

    pub fn invoker(&self) -> Option<Arc<ClientInvoker>> {
        self.state.lock().invoker.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .invoker
            .as_ref()
            .is_some_and(|inv| inv.is_connected())
    }

    /// Lease period in use, `None` when the client is not leased.
    pub fn lease_period(&self) -> Option<Duration> {
        self.state.lock().lease_period
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Override the `disconnectTimeout` config for teardown traffic.
    pub fn set_disconnect_timeout(&self, timeout: DisconnectTimeout) {
        self.state.lock().disconnect_timeout = Some(timeout);
    }

    fn disconnect_timeout(&self) -> DisconnectTimeout {
        self.state
            .lock()
            .disconnect_timeout
            .unwrap_or_else(|| self.config.disconnect_timeout())
    }

    fn require_invoker(&self) -> Result<Arc<ClientInvoker>> {
        self.state.lock().invoker.clone().ok_or(Error::NotConnected)
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Borrow the invoker and join its lease. Idempotent.
    ///
    /// Network work runs outside the state lock; concurrent connects on one
    /// client are serialized so the session joins the lease once.
    pub fn connect(&self) -> Result<()> {
        let _connecting = self.connect_ops.lock();
        if self.state.lock().invoker.is_some() {
            return Ok(());
        }

        let registry = self.context.registry();
        let invoker = registry.create_client_invoker(&self.locator, &self.config)?;
        if let Err(e) = invoker.connect() {
            registry.destroy_client_invoker(&self.locator, &self.config);
            return Err(e);
        }

        let mut lease_period = None;
        if self.config.get_bool(keys::ENABLE_LEASE, false) {
            let requested = self.config.get_millis(keys::LEASE_PERIOD);
            match invoker.establish_lease(&self.session_id, &self.config, requested) {
                Ok(period) => lease_period = period,
                Err(e) => {
                    log::warn!("[client] lease with {} failed: {}", self.locator, e);
                    registry.destroy_client_invoker(&self.locator, &self.config);
                    return Err(e);
                }
            }
        }

        log::debug!(
            "[client] {} connected to {} (lease {:?})",
            self.session_id,
            self.locator,
            lease_period
        );
        let mut state = self.state.lock();
        state.lease_period = lease_period;
        state.invoker = Some(invoker);
        Ok(())
    }

    /// [`connect`](Self::connect), then watch the connection with `listener`.
    pub fn connect_with_listener(
        &self,
        listener: Arc<dyn ConnectionListener>,
        metadata: Option<Config>,
    ) -> Result<()> {
        self.connect()?;
        self.add_connection_listener(listener, metadata)
    }

    /// Attach `listener` to the connection validator for this client's
    /// invoker. `metadata` carries the validator options.
    pub fn add_connection_listener(
        &self,
        listener: Arc<dyn ConnectionListener>,
        metadata: Option<Config>,
    ) -> Result<()> {
        let invoker = self.require_invoker()?;
        let metadata = metadata.unwrap_or_default();
        let period = self
            .lease_period()
            .unwrap_or_else(|| self.config.get_millis_or(keys::LEASE_PERIOD, DEFAULT_LEASE_PERIOD));
        let holder = ClientHolder::new(self.session_id.clone(), period, self.config.clone());
        let validator =
            self.context
                .validators()
                .attach(&invoker, &metadata, Arc::clone(&listener), holder)?;
        self.state
            .lock()
            .validators
            .push(ValidatorLink { validator, listener });
        Ok(())
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let key = listener_key(listener);
        let link = {
            let mut state = self.state.lock();
            let Some(pos) = state
                .validators
                .iter()
                .position(|l| listener_key(&l.listener) == key)
            else {
                return false;
            };
            state.validators.remove(pos)
        };
        self.context
            .validators()
            .detach(&link.validator, &link.listener, &self.session_id);
        true
    }

    /// Tear down listeners, validators and the lease, then give the invoker
    /// back to the registry. Idempotent.
    pub fn disconnect(&self) {
        let handlers: Vec<Arc<dyn CallbackHandler>> = self
            .state
            .lock()
            .listeners
            .iter()
            .map(|l| Arc::clone(&l.handler))
            .collect();
        for handler in &handlers {
            self.remove_listener(handler);
        }

        let timeout = self.disconnect_timeout();
        let (invoker, leased, validators, connectors) = {
            let mut state = self.state.lock();
            (
                state.invoker.take(),
                state.lease_period.take().is_some(),
                std::mem::take(&mut state.validators),
                std::mem::take(&mut state.connectors),
            )
        };

        for link in validators {
            self.context
                .validators()
                .detach(&link.validator, &link.listener, &self.session_id);
        }
        for (_, cc) in connectors {
            cc.client.disconnect();
            cc.connector.stop();
        }
        if let Some(pool) = self.oneway_pool.lock().take() {
            pool.shutdown();
        }

        let Some(invoker) = invoker else {
            return;
        };
        if leased {
            invoker.terminate_lease(&self.session_id, timeout);
        }

        let registry = self.context.registry();
        match self
            .config
            .get_millis(keys::INVOKER_DESTRUCTION_DELAY)
            .filter(|d| !d.is_zero())
        {
            Some(delay) => {
                if let Err(e) =
                    registry.destroy_client_invoker_after(&self.locator, &self.config, delay)
                {
                    log::warn!("[client] deferred invoker release failed: {}", e);
                    registry.destroy_client_invoker(&self.locator, &self.config);
                }
            }
            None => registry.destroy_client_invoker(&self.locator, &self.config),
        }
        log::debug!("[client] {} disconnected from {}", self.session_id, self.locator);
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    /// Synchronous invocation; server faults come back with this client's
    /// frame appended.
    pub fn invoke(&self, payload: impl Into<Payload>, metadata: Option<Metadata>) -> Result<Value> {
        let request = self.request(payload.into(), metadata);
        let invoker = self.require_invoker()?;
        invoker
            .invoke(request)?
            .into_result()
            .map_err(|e| self.stitch(e, "invoke"))
    }

    /// Fire-and-forget invocation.
    ///
    /// `client_side` runs the round trip on this client's worker pool and
    /// logs faults; otherwise the server runs it off its request thread.
    pub fn invoke_oneway(
        &self,
        payload: impl Into<Payload>,
        metadata: Option<Metadata>,
        client_side: bool,
    ) -> Result<()> {
        let invoker = self.require_invoker()?;
        let payload = payload.into();
        if !client_side {
            invoker.invoke(self.request(payload.oneway(), metadata))?;
            return Ok(());
        }

        let request = self.request(payload, metadata);
        let locator = self.locator.clone();
        self.oneway_pool()?.submit(move || {
            if let Err(e) = invoker.invoke(request).and_then(|r| r.into_result()) {
                log::warn!("[client] oneway invocation on {} failed: {}", locator, e);
            }
        })
    }

    pub(crate) fn invoke_internal(
        &self,
        internal: InternalInvocation,
        metadata: Option<Metadata>,
    ) -> Result<Value> {
        self.invoke(internal, metadata)
    }

    /// Address the server sees this client connecting from.
    pub fn client_local_address(&self) -> Result<Option<IpAddr>> {
        let value = self.invoke(Command::GetClientLocalAddress, None)?;
        Ok(value.as_str().and_then(|s| s.parse().ok()))
    }

    fn request(&self, payload: Payload, metadata: Option<Metadata>) -> InvocationRequest {
        let request = InvocationRequest::new(self.session_id.clone(), payload)
            .with_subsystem(self.subsystem.clone())
            .with_origin(self.origin_locator());
        match metadata {
            Some(metadata) => request.with_metadata(metadata),
            None => request,
        }
    }

    /// Where the server can reach this client back: a running callback
    /// connector, else the transport's own callback locator.
    fn origin_locator(&self) -> Option<Locator> {
        let state = self.state.lock();
        state
            .connectors
            .values()
            .map(|cc| cc.resolved.clone())
            .min_by(|a, b| a.uri().cmp(b.uri()))
            .or_else(|| state.invoker.as_ref().and_then(|i| i.callback_locator()))
    }

    fn stitch(&self, err: Error, operation: &str) -> Error {
        match err {
            Error::RemoteApplication(fault) => Error::RemoteApplication(
                fault.stitch(format!("Client[{}].{}", self.locator, operation)),
            ),
            other => other,
        }
    }

    fn oneway_pool(&self) -> Result<Arc<WorkerPool>> {
        let mut slot = self.oneway_pool.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(WorkerPool::new(
            "client-oneway",
            self.config
                .get_usize(keys::MAX_NUM_THREADS_ONEWAY, DEFAULT_ONEWAY_THREADS),
            self.config
                .get_usize(keys::MAX_ONEWAY_QUEUE_SIZE, DEFAULT_ONEWAY_QUEUE_SIZE),
        )?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    // ========================================================================
    // Callback listeners
    // ========================================================================

    /// Register `handler` for callbacks from the server.
    ///
    /// `server_to_client` asks for push delivery through a local callback
    /// server even when the transport is not bidirectional. Registering the
    /// same handler twice is a validation error.
    pub fn add_listener(
        &self,
        handler: Arc<dyn CallbackHandler>,
        metadata: Option<Config>,
        handle_object: Option<Value>,
        server_to_client: bool,
    ) -> Result<()> {
        let _ops = self.listener_ops.lock();
        let invoker = self.require_invoker()?;
        let key = handler_key(&handler);
        if self
            .state
            .lock()
            .listeners
            .iter()
            .any(|l| handler_key(&l.handler) == key)
        {
            return Err(Error::Validation("callback handler already registered".into()));
        }

        let metadata = metadata.unwrap_or_default();
        let route = ListenerRoute {
            invoker: Arc::downgrade(&invoker),
            session_id: self.session_id.clone(),
            subsystem: self.subsystem.clone(),
            listener_id: uuid::Uuid::new_v4().to_string(),
        };

        let push_locator = if server_to_client {
            Some(match metadata.get(keys::CALLBACK_LOCATOR) {
                Some(uri) => Locator::parse(uri)?,
                None => Locator::new(self.locator.protocol(), "0.0.0.0", Some(0))?,
            })
        } else if invoker.is_bidirectional() {
            invoker.callback_locator()
        } else {
            None
        };

        let mode = match push_locator {
            Some(requested) => {
                self.register_push(&route, &handler, handle_object, &requested)?;
                ListenerMode::Push {
                    connector: requested,
                }
            }
            None => {
                route.send(
                    InternalInvocation::AddListener {
                        listener_id: route.listener_id.clone(),
                        callback_locator: None,
                    },
                    None,
                )?;
                let period = metadata.get_millis(keys::CALLBACK_POLL_PERIOD).unwrap_or_else(|| {
                    self.config
                        .get_millis_or(keys::CALLBACK_POLL_PERIOD, DEFAULT_CALLBACK_POLL_PERIOD)
                });
                let poller = CallbackPoller::start(route.clone(), Arc::clone(&handler), period)?;
                ListenerMode::Pull { poller }
            }
        };

        log::debug!(
            "[client] {} listener {} added on {}",
            if matches!(mode, ListenerMode::Pull { .. }) { "pull" } else { "push" },
            route.listener_id,
            self.locator
        );
        self.state.lock().listeners.push(CallbackListener {
            handler,
            route,
            mode,
        });
        Ok(())
    }

    /// Callback server first, then the primary server.
    fn register_push(
        &self,
        route: &ListenerRoute,
        handler: &Arc<dyn CallbackHandler>,
        handle_object: Option<Value>,
        requested: &Locator,
    ) -> Result<()> {
        let (resolved, internal) = self.acquire_callback_connector(requested)?;
        let registered = internal.invoke_internal(
            InternalInvocation::AddClientListener {
                listener_id: route.listener_id.clone(),
                handle_object,
                handler: LocalHandler(Some(Arc::clone(handler))),
            },
            None,
        );
        if let Err(e) = registered {
            self.release_callback_connector(requested);
            return Err(e);
        }

        let announced = route.send(
            InternalInvocation::AddListener {
                listener_id: route.listener_id.clone(),
                callback_locator: Some(resolved),
            },
            None,
        );
        if let Err(e) = announced {
            let _ = internal.invoke_internal(
                InternalInvocation::RemoveClientListener {
                    listener_id: route.listener_id.clone(),
                },
                None,
            );
            self.release_callback_connector(requested);
            return Err(e);
        }
        Ok(())
    }

    fn acquire_callback_connector(&self, requested: &Locator) -> Result<(Locator, Arc<Client>)> {
        if let Some(cc) = self.state.lock().connectors.get_mut(requested) {
            cc.listeners += 1;
            return Ok((cc.resolved.clone(), Arc::clone(&cc.client)));
        }

        let connector = Connector::new(Arc::clone(&self.context), requested, Config::new());
        let resolved = connector.start()?;
        let client = Client::new(Arc::clone(&self.context), &resolved, Config::new())?;
        client.connect()?;
        let client = Arc::new(client);
        log::debug!("[client] callback connector started at {}", resolved);

        self.state.lock().connectors.insert(
            requested.clone(),
            CallbackConnector {
                connector,
                client: Arc::clone(&client),
                resolved: resolved.clone(),
                listeners: 1,
            },
        );
        Ok((resolved, client))
    }

    fn release_callback_connector(&self, requested: &Locator) {
        let doomed = {
            let mut state = self.state.lock();
            let Some(cc) = state.connectors.get_mut(requested) else {
                return;
            };
            cc.listeners -= 1;
            if cc.listeners > 0 {
                return;
            }
            state.connectors.remove(requested)
        };
        if let Some(cc) = doomed {
            cc.client.disconnect();
            cc.connector.stop();
            log::debug!("[client] callback connector at {} stopped", cc.resolved);
        }
    }

    /// Unregister `handler`. Network calls are best effort and skipped with
    /// a zero disconnect timeout; local state is always cleaned.
    pub fn remove_listener(&self, handler: &Arc<dyn CallbackHandler>) -> bool {
        let _ops = self.listener_ops.lock();
        let key = handler_key(handler);
        let listener = {
            let mut state = self.state.lock();
            let Some(pos) = state
                .listeners
                .iter()
                .position(|l| handler_key(&l.handler) == key)
            else {
                return false;
            };
            state.listeners.remove(pos)
        };

        if let ListenerMode::Pull { poller } = &listener.mode {
            poller.stop();
        }

        let timeout = self.disconnect_timeout();
        let listener_id = listener.route.listener_id.clone();
        if !timeout.skips_network() {
            if let Err(e) = listener.route.send(
                InternalInvocation::RemoveListener {
                    listener_id: listener_id.clone(),
                },
                timeout.per_call(),
            ) {
                log::debug!("[client] REMOVELISTENER {} failed: {}", listener_id, e);
            }
        }

        if let ListenerMode::Push { connector } = &listener.mode {
            let internal = self
                .state
                .lock()
                .connectors
                .get(connector)
                .map(|cc| Arc::clone(&cc.client));
            if let Some(internal) = internal {
                if let Err(e) = internal.invoke_internal(
                    InternalInvocation::RemoveClientListener {
                        listener_id: listener_id.clone(),
                    },
                    None,
                ) {
                    log::debug!("[client] REMOVECLIENTLISTENER {} failed: {}", listener_id, e);
                }
            }
            self.release_callback_connector(connector);
        }
        log::debug!("[client] listener {} removed", listener_id);
        true
    }

    fn route_of(&self, handler: &Arc<dyn CallbackHandler>) -> Result<(ListenerRoute, bool)> {
        let key = handler_key(handler);
        self.state
            .lock()
            .listeners
            .iter()
            .find(|l| handler_key(&l.handler) == key)
            .map(|l| (l.route.clone(), matches!(l.mode, ListenerMode::Pull { .. })))
            .ok_or_else(|| Error::InvalidState("callback handler is not registered".into()))
    }

    /// Drain queued callbacks now, for a pull listener.
    pub fn get_callbacks(&self, handler: &Arc<dyn CallbackHandler>) -> Result<Vec<Callback>> {
        let (route, pull) = self.route_of(handler)?;
        if !pull {
            return Err(Error::InvalidState(
                "push listeners have no queued callbacks".into(),
            ));
        }
        route.fetch()
    }

    pub fn acknowledge_callback(
        &self,
        handler: &Arc<dyn CallbackHandler>,
        callback: &Callback,
        response: Option<Value>,
    ) -> Result<usize> {
        let responses = response.map(|r| vec![r]);
        self.acknowledge_callbacks(handler, std::slice::from_ref(callback), responses.as_deref())
    }

    /// Acknowledge `callbacks` in one batch.
    ///
    /// Every callback must belong to `handler`'s listener and `responses`,
    /// when given, must pair one to one with `callbacks`; otherwise nothing
    /// is sent. Callbacks without an id are skipped. Returns the number the
    /// server acknowledged.
    pub fn acknowledge_callbacks(
        &self,
        handler: &Arc<dyn CallbackHandler>,
        callbacks: &[Callback],
        responses: Option<&[Value]>,
    ) -> Result<usize> {
        let Some(first) = callbacks.first() else {
            return Ok(0);
        };
        if callbacks.iter().any(|cb| cb.listener_id != first.listener_id) {
            return Err(Error::Validation(
                "callbacks in one acknowledgement must share a listener".into(),
            ));
        }
        if let Some(r) = responses {
            if r.len() != callbacks.len() {
                return Err(Error::Validation(format!(
                    "{} responses for {} callbacks",
                    r.len(),
                    callbacks.len()
                )));
            }
        }
        let (route, _) = self.route_of(handler)?;
        if route.listener_id != first.listener_id {
            return Err(Error::Validation(format!(
                "callbacks belong to listener {}, not {}",
                first.listener_id, route.listener_id
            )));
        }

        let mut ids = Vec::with_capacity(callbacks.len());
        let mut kept = Vec::with_capacity(callbacks.len());
        for (i, cb) in callbacks.iter().enumerate() {
            if let Some(id) = &cb.callback_id {
                ids.push(id.clone());
                if let Some(r) = responses {
                    kept.push(r[i].clone());
                }
            }
        }
        if ids.is_empty() {
            return Ok(0);
        }
        route.acknowledge(ids, responses.map(|_| kept))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("locator", &self.locator)
            .field("session_id", &self.session_id)
            .field("subsystem", &self.subsystem)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{InvocationResponse, RemoteFault};
    use crate::invoker::testing::ScriptedTransport;
    use crate::invoker::{ClientTransport, ServerTransport, TransportFactory};
    use serde_json::json;

    /// Hands out one scripted transport; servers are not supported.
    struct ScriptedFactory(Mutex<Option<ScriptedTransport>>);

    impl TransportFactory for ScriptedFactory {
        fn create_client(&self, _: &Locator, _: &Config) -> Result<Box<dyn ClientTransport>> {
            self.0
                .lock()
                .take()
                .map(|t| Box::new(t) as Box<dyn ClientTransport>)
                .ok_or_else(|| Error::Transport("scripted transport already used".into()))
        }

        fn create_server(&self, _: &Locator, _: &Config) -> Result<Box<dyn ServerTransport>> {
            Err(Error::Configuration("no scripted servers".into()))
        }
    }

    fn scripted_context(transport: ScriptedTransport) -> Arc<RemotingContext> {
        let ctx = RemotingContext::bare();
        ctx.register_transport("scripted", Arc::new(ScriptedFactory(Mutex::new(Some(transport)))));
        ctx
    }

    fn handler<F>(f: F) -> Arc<dyn CallbackHandler>
    where
        F: Fn(&Callback) -> std::result::Result<(), RemoteFault> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn callback(listener_id: &str, id: &str) -> Callback {
        let mut cb = Callback::new(json!(id));
        cb.listener_id = listener_id.to_string();
        cb.callback_id = Some(id.to_string());
        cb
    }

    #[test]
    fn unknown_protocol_rejected() {
        let ctx = RemotingContext::new();
        let err = Client::new(ctx, &Locator::parse("carrier-pigeon://h:1").unwrap(), Config::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownProtocol(_)));
    }

    #[test]
    fn invoke_requires_connect() {
        let (transport, _) = ScriptedTransport::leasing(1000);
        let ctx = scripted_context(transport);
        let client = Client::new(ctx, &Locator::parse("scripted://h:1").unwrap(), Config::new()).unwrap();
        assert!(matches!(client.invoke(json!(1), None), Err(Error::NotConnected)));
    }

    #[test]
    fn no_lease_without_enable_lease() {
        let (transport, requests) = ScriptedTransport::new(|req| {
            Ok(InvocationResponse::value(req.session_id.clone(), json!("pong")))
        });
        let ctx = scripted_context(transport);
        let client = Client::new(ctx, &Locator::parse("scripted://h:1").unwrap(), Config::new()).unwrap();
        client.connect().unwrap();
        assert_eq!(client.invoke(json!("hi"), None).unwrap(), json!("pong"));
        assert_eq!(client.lease_period(), None);
        assert!(client.invoker().unwrap().lease_pinger().is_none());
        assert_eq!(requests.lock().len(), 1);
    }

    #[test]
    fn slow_connect_leaves_state_queries_responsive() {
        let (transport, _) = ScriptedTransport::new(|req| {
            if matches!(req.payload.as_command(), Some(Command::Ping)) {
                std::thread::sleep(Duration::from_millis(300));
            }
            let answer = crate::invocation::PingResponse {
                leasing_enabled: true,
                lease_period_ms: 10_000,
            };
            Ok(InvocationResponse::value(
                req.session_id.clone(),
                serde_json::to_value(answer)?,
            ))
        });
        let ctx = scripted_context(transport);
        let client = Arc::new(
            Client::new(
                ctx,
                &Locator::parse("scripted://h:1").unwrap(),
                Config::new().with(keys::ENABLE_LEASE, true),
            )
            .unwrap(),
        );
        let connects: Vec<_> = (0..2)
            .map(|_| {
                let c = Arc::clone(&client);
                std::thread::spawn(move || c.connect())
            })
            .collect();

        std::thread::sleep(Duration::from_millis(100));
        let asked = std::time::Instant::now();
        assert!(!client.is_connected());
        assert_eq!(client.lease_period(), None);
        assert_eq!(client.listener_count(), 0);
        assert!(asked.elapsed() < Duration::from_millis(150));

        for c in connects {
            c.join().unwrap().unwrap();
        }
        assert!(client.is_connected());
        assert_eq!(client.lease_period(), Some(Duration::from_millis(10_000)));
        let registry = client.context.registry();
        assert_eq!(registry.client_refcount(client.locator(), client.config()), 1);
        let pinger = client.invoker().unwrap().lease_pinger().unwrap();
        assert_eq!(pinger.client_count(), 1);
        client.set_disconnect_timeout(DisconnectTimeout::SkipNetwork);
    }

    #[test]
    fn cross_listener_ack_batch_sends_nothing() {
        let (transport, requests) = ScriptedTransport::new(|req| {
            Ok(InvocationResponse::value(req.session_id.clone(), json!([])))
        });
        let ctx = scripted_context(transport);
        let client = Client::new(
            ctx,
            &Locator::parse("scripted://h:1").unwrap(),
            Config::new().with(keys::CALLBACK_POLL_PERIOD, 60_000),
        )
        .unwrap();
        client.connect().unwrap();
        let h = handler(|_| Ok(()));
        client.add_listener(Arc::clone(&h), None, None, false).unwrap();
        let sent = requests.lock().len();

        let mixed = [callback("l-1", "a"), callback("l-2", "b")];
        let err = client.acknowledge_callbacks(&h, &mixed, None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let same = [callback("l-1", "a"), callback("l-1", "b")];
        let err = client
            .acknowledge_callbacks(&h, &same, Some(&[json!(1)]))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert_eq!(requests.lock().len(), sent);
    }

    #[test]
    fn duplicate_handler_rejected() {
        let (transport, _) = ScriptedTransport::new(|req| {
            Ok(InvocationResponse::value(req.session_id.clone(), json!([])))
        });
        let ctx = scripted_context(transport);
        let client = Client::new(
            ctx,
            &Locator::parse("scripted://h:1").unwrap(),
            Config::new().with(keys::CALLBACK_POLL_PERIOD, 60_000),
        )
        .unwrap();
        client.connect().unwrap();
        let h = handler(|_| Ok(()));
        client.add_listener(Arc::clone(&h), None, None, false).unwrap();
        let err = client.add_listener(Arc::clone(&h), None, None, false).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(client.listener_count(), 1);

        assert!(client.remove_listener(&h));
        assert!(!client.remove_listener(&h));
        assert_eq!(client.listener_count(), 0);
    }

    #[test]
    fn zero_disconnect_timeout_skips_remove_listener() {
        let (transport, requests) = ScriptedTransport::new(|req| {
            Ok(InvocationResponse::value(req.session_id.clone(), json!([])))
        });
        let ctx = scripted_context(transport);
        let client = Client::new(
            ctx,
            &Locator::parse("scripted://h:1").unwrap(),
            Config::new().with(keys::CALLBACK_POLL_PERIOD, 60_000),
        )
        .unwrap();
        client.connect().unwrap();
        let h = handler(|_| Ok(()));
        client.add_listener(Arc::clone(&h), None, None, false).unwrap();
        client.set_disconnect_timeout(DisconnectTimeout::SkipNetwork);
        let sent = requests.lock().len();
        assert!(client.remove_listener(&h));
        assert_eq!(requests.lock().len(), sent);
    }
}

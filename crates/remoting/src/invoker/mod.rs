// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport-agnostic invokers.
//!
//! A transport plugs in through three traits:
//!
//! - [`ClientTransport`]: one physical client connection (connect, invoke).
//! - [`ServerTransport`]: one listening endpoint feeding a [`ServerInvoker`].
//! - [`TransportFactory`]: builds both for a protocol name.
//!
//! [`ClientInvoker`] wraps a client transport with the bookkeeping every
//! transport shares: the invoker session id that keys the server-side lease,
//! and the lease pinger multiplexing all logical clients of the connection.

pub mod registry;

pub use registry::InvokerRegistry;

use crate::config::{Config, DisconnectTimeout};
use crate::error::{Error, Result};
use crate::invocation::{Command, InvocationRequest, InvocationResponse, PingResponse};
use crate::locator::Locator;
use crate::pinger::LeasePinger;
use crate::server::ServerInvoker;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Client side of a transport.
pub trait ClientTransport: Send + Sync {
    fn connect(&self) -> Result<()>;

    fn disconnect(&self);

    /// Round trip one request. Oneway requests return an empty response
    /// without waiting for the server.
    fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse>;

    /// The transport can carry server-initiated calls back to this client.
    fn is_bidirectional(&self) -> bool {
        false
    }

    /// Locator the server should use to reach this client's callback
    /// connector, for bidirectional transports.
    fn callback_locator(&self) -> Option<Locator> {
        None
    }

    fn local_address(&self) -> Option<SocketAddr> {
        None
    }
}

/// Server side of a transport.
pub trait ServerTransport: Send + Sync {
    /// Start accepting requests for `invoker`; returns the resolved locator
    /// (real port once an ephemeral one is bound).
    fn start(&self, invoker: Arc<ServerInvoker>) -> Result<Locator>;

    fn stop(&self);
}

/// Builds transports for one protocol.
pub trait TransportFactory: Send + Sync {
    fn create_client(&self, locator: &Locator, config: &Config) -> Result<Box<dyn ClientTransport>>;

    fn create_server(&self, locator: &Locator, config: &Config) -> Result<Box<dyn ServerTransport>>;
}

/// Client invoker: one physical connection shared by every logical client
/// holding it through the registry.
pub struct ClientInvoker {
    locator: Locator,
    config: Config,
    session_id: String,
    transport: Box<dyn ClientTransport>,
    connected: AtomicBool,
    loopback: bool,
    lease_pinger: Mutex<Option<Arc<LeasePinger>>>,
}

impl ClientInvoker {
    pub fn new(
        locator: Locator,
        config: Config,
        transport: Box<dyn ClientTransport>,
        loopback: bool,
    ) -> Self {
        Self {
            locator,
            config,
            session_id: uuid::Uuid::new_v4().to_string(),
            transport,
            connected: AtomicBool::new(false),
            loopback,
            lease_pinger: Mutex::new(None),
        }
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Invoker session id; keys the server-side lease.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True when the invoker dispatches into an in-process server.
    pub fn is_loopback(&self) -> bool {
        self.loopback
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_bidirectional(&self) -> bool {
        self.transport.is_bidirectional()
    }

    pub fn callback_locator(&self) -> Option<Locator> {
        self.transport.callback_locator()
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.transport.local_address()
    }

    /// Connect the transport. Idempotent.
    pub fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.transport.connect()?;
        self.connected.store(true, Ordering::Release);
        log::debug!(
            "[invoker] {} connected (session {})",
            self.locator,
            self.session_id
        );
        Ok(())
    }

    /// Stop the lease pinger without network traffic and drop the connection.
    pub fn disconnect(&self) {
        self.force_stop_lease();
        if self.connected.swap(false, Ordering::AcqRel) {
            self.transport.disconnect();
            log::debug!("[invoker] {} disconnected", self.locator);
        }
    }

    pub fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.transport.invoke(request)
    }

    /// Register a logical client on this connection's lease.
    ///
    /// The first client sends a plain `$PING$` to learn whether the server
    /// leases at all. Returns the lease period in use, or `None` if the
    /// server does not lease.
    pub fn establish_lease(
        self: &Arc<Self>,
        client_session_id: &str,
        client_config: &Config,
        lease_period: Option<Duration>,
    ) -> Result<Option<Duration>> {
        // Zero means "no preference", never a zero-length lease.
        let lease_period = lease_period.filter(|p| !p.is_zero());
        let mut slot = self.lease_pinger.lock();
        if let Some(pinger) = slot.as_ref() {
            let period = lease_period.unwrap_or_else(|| pinger.ping_period());
            pinger.add_client(client_session_id, client_config, period)?;
            return Ok(Some(period));
        }

        let probe = InvocationRequest::new(self.session_id.clone(), Command::Ping);
        let answer = self.invoke(probe)?.into_result()?;
        let ping: PingResponse = serde_json::from_value(answer)?;
        if !ping.leasing_enabled {
            log::debug!("[invoker] {} does not lease clients", self.locator);
            return Ok(None);
        }

        let period = lease_period.unwrap_or_else(|| ping.lease_period());
        let pinger = LeasePinger::new(
            Arc::downgrade(self),
            self.session_id.clone(),
            self.config.disconnect_timeout(),
        );
        pinger.add_client(client_session_id, client_config, period)?;
        pinger.start_ping()?;
        log::debug!(
            "[invoker] lease established with {} (period {:?}, pinger {})",
            self.locator,
            period,
            pinger.lease_pinger_id()
        );
        *slot = Some(pinger);
        Ok(Some(period))
    }

    /// Remove a logical client from the lease; the last one stops the pinger.
    pub fn terminate_lease(&self, client_session_id: &str, timeout: DisconnectTimeout) {
        let mut slot = self.lease_pinger.lock();
        let last = match slot.as_ref() {
            Some(pinger) => {
                pinger.set_disconnect_timeout(timeout);
                pinger.remove_client(client_session_id)
            }
            None => return,
        };
        if last {
            if let Some(pinger) = slot.take() {
                pinger.stop_ping();
            }
        }
    }

    /// Stop pinging without telling the server.
    pub fn force_stop_lease(&self) {
        if let Some(pinger) = self.lease_pinger.lock().take() {
            pinger.set_disconnect_timeout(DisconnectTimeout::SkipNetwork);
            pinger.stop_ping();
        }
    }

    pub fn lease_pinger(&self) -> Option<Arc<LeasePinger>> {
        self.lease_pinger.lock().clone()
    }

    pub fn lease_pinger_id(&self) -> Option<String> {
        self.lease_pinger
            .lock()
            .as_ref()
            .map(|p| p.lease_pinger_id().to_string())
    }
}

impl std::fmt::Debug for ClientInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInvoker")
            .field("locator", &self.locator)
            .field("session_id", &self.session_id)
            .field("connected", &self.is_connected())
            .field("loopback", &self.loopback)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for unit tests.

    use super::*;
    use crate::invocation::{meta, Payload};
    use parking_lot::Mutex;
    use serde_json::Value;

    type Responder = dyn Fn(&InvocationRequest) -> Result<InvocationResponse> + Send + Sync;

    /// Records every request and answers through a closure.
    pub struct ScriptedTransport {
        pub requests: Arc<Mutex<Vec<InvocationRequest>>>,
        responder: Box<Responder>,
    }

    impl ScriptedTransport {
        pub fn new<F>(responder: F) -> (Self, Arc<Mutex<Vec<InvocationRequest>>>)
        where
            F: Fn(&InvocationRequest) -> Result<InvocationResponse> + Send + Sync + 'static,
        {
            let requests = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    requests: Arc::clone(&requests),
                    responder: Box::new(responder),
                },
                requests,
            )
        }

        /// Server that leases with `period_ms` and accepts everything.
        pub fn leasing(period_ms: u64) -> (Self, Arc<Mutex<Vec<InvocationRequest>>>) {
            Self::new(move |req| {
                let value = match req.payload.as_command() {
                    Some(Command::Ping) if req.meta(meta::INVOKER_SESSION_ID).is_some() => {
                        Value::Bool(true)
                    }
                    Some(Command::Ping) => serde_json::to_value(PingResponse {
                        leasing_enabled: true,
                        lease_period_ms: period_ms,
                    })?,
                    _ => Value::Null,
                };
                Ok(InvocationResponse::value(req.session_id.clone(), value))
            })
        }
    }

    impl ClientTransport for ScriptedTransport {
        fn connect(&self) -> Result<()> {
            Ok(())
        }

        fn disconnect(&self) {}

        fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse> {
            let response = (self.responder)(&request);
            self.requests.lock().push(request);
            response
        }
    }

    pub fn count_commands(requests: &Mutex<Vec<InvocationRequest>>, cmd: Command) -> usize {
        requests
            .lock()
            .iter()
            .filter(|r| matches!(&r.payload, Payload::Command(c) if *c == cmd))
            .count()
    }

    pub fn invoker_over(transport: ScriptedTransport) -> Arc<ClientInvoker> {
        let locator = Locator::parse("test://scripted:1").unwrap_or_else(|e| panic!("{}", e));
        let invoker = Arc::new(ClientInvoker::new(
            locator,
            Config::new(),
            Box::new(transport),
            false,
        ));
        invoker.connect().unwrap_or_else(|e| panic!("{}", e));
        invoker
    }
}

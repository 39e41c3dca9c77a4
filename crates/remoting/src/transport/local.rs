// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process loopback transport.
//!
//! A client invoker over this transport calls straight into a server invoker
//! of the same process: requests are handed over as values, so in-process
//! only data (such as a callback handler riding on `ADDCLIENTLISTENER`)
//! survives the trip.

use super::LOCAL_PROTOCOL;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::invocation::{InvocationRequest, InvocationResponse};
use crate::invoker::{ClientTransport, InvokerRegistry, ServerTransport, TransportFactory};
use crate::locator::Locator;
use crate::server::ServerInvoker;
use parking_lot::RwLock;
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

/// First port handed out for `local://host:0` servers.
const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// Port allocator for `local://host:0` servers of one context.
struct EphemeralPorts(AtomicU16);

impl EphemeralPorts {
    fn next(&self) -> u16 {
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(if p == u16::MAX { FIRST_EPHEMERAL_PORT } else { p + 1 })
            })
            .unwrap_or_else(|p| p)
    }
}

/// Factory for `local://` locators.
pub struct LocalTransportFactory {
    registry: Weak<InvokerRegistry>,
    ports: Arc<EphemeralPorts>,
}

impl LocalTransportFactory {
    pub fn new(registry: Weak<InvokerRegistry>) -> Self {
        Self {
            registry,
            ports: Arc::new(EphemeralPorts(AtomicU16::new(FIRST_EPHEMERAL_PORT))),
        }
    }
}

impl TransportFactory for LocalTransportFactory {
    fn create_client(&self, locator: &Locator, _config: &Config) -> Result<Box<dyn ClientTransport>> {
        Ok(Box::new(LocalClientTransport::unbound(
            locator.clone(),
            self.registry.clone(),
        )))
    }

    fn create_server(&self, locator: &Locator, _config: &Config) -> Result<Box<dyn ServerTransport>> {
        Ok(Box::new(LocalServerTransport {
            locator: locator.clone(),
            ports: Arc::clone(&self.ports),
        }))
    }
}

/// Loopback client side.
pub struct LocalClientTransport {
    locator: Locator,
    registry: Weak<InvokerRegistry>,
    server: RwLock<Weak<ServerInvoker>>,
    callback_locator: Option<Locator>,
}

impl LocalClientTransport {
    /// Transport already pointing at `server`.
    pub fn bound(locator: Locator, server: &Arc<ServerInvoker>) -> Self {
        Self {
            locator,
            registry: Weak::new(),
            server: RwLock::new(Arc::downgrade(server)),
            callback_locator: callback_locator(),
        }
    }

    /// Transport that finds its server through `registry` on connect.
    pub fn unbound(locator: Locator, registry: Weak<InvokerRegistry>) -> Self {
        Self {
            locator,
            registry,
            server: RwLock::new(Weak::new()),
            callback_locator: callback_locator(),
        }
    }

    fn server(&self) -> Result<Arc<ServerInvoker>> {
        self.server
            .read()
            .upgrade()
            .ok_or_else(|| Error::cannot_connect(&self.locator, "server invoker is gone"))
    }
}

/// Unique per transport, so each client gets its own callback endpoint.
fn callback_locator() -> Option<Locator> {
    let host = format!("callback-{}", uuid::Uuid::new_v4().simple());
    Locator::new(LOCAL_PROTOCOL, &host, None).ok()
}

impl ClientTransport for LocalClientTransport {
    fn connect(&self) -> Result<()> {
        if self.server.read().upgrade().is_some() {
            return Ok(());
        }
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| Error::cannot_connect(&self.locator, "remoting context is gone"))?;
        let server = registry
            .find_local_server(&self.locator)
            .ok_or_else(|| Error::cannot_connect(&self.locator, "no server invoker in this process"))?;
        *self.server.write() = Arc::downgrade(&server);
        Ok(())
    }

    fn disconnect(&self) {}

    fn invoke(&self, mut request: InvocationRequest) -> Result<InvocationResponse> {
        let server = self.server()?;
        request.peer_address = Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
        if request.is_oneway() {
            let session_id = request.session_id.clone();
            server.invoke(request);
            return Ok(InvocationResponse::value(session_id, Value::Null));
        }
        Ok(server.invoke(request))
    }

    fn is_bidirectional(&self) -> bool {
        true
    }

    fn callback_locator(&self) -> Option<Locator> {
        self.callback_locator.clone()
    }

    fn local_address(&self) -> Option<SocketAddr> {
        Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }
}

/// Loopback server side: nothing to listen on. Port 0 is replaced by a
/// port unique within the owning context.
pub struct LocalServerTransport {
    locator: Locator,
    ports: Arc<EphemeralPorts>,
}

impl ServerTransport for LocalServerTransport {
    fn start(&self, _invoker: Arc<ServerInvoker>) -> Result<Locator> {
        match self.locator.port() {
            Some(0) => Ok(self.locator.with_port(self.ports.next())),
            _ => Ok(self.locator.clone()),
        }
    }

    fn stop(&self) {}
}

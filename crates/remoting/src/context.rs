// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Composition root.
//!
//! A [`RemotingContext`] owns the state shared between clients and servers
//! of one process (or one test): the invoker registry with its transport
//! factories, and the connection validator table. Nothing is global; every
//! `Client` and `Connector` is built against a context.

use crate::invoker::{InvokerRegistry, TransportFactory};
use crate::transport::{LocalTransportFactory, SocketTransportFactory, LOCAL_PROTOCOL, SOCKET_PROTOCOL};
use crate::validator::ValidatorTable;
use std::sync::{Arc, Weak};

pub struct RemotingContext {
    registry: Arc<InvokerRegistry>,
    validators: ValidatorTable,
}

impl RemotingContext {
    /// Context with the `local` and `socket` transports registered.
    pub fn new() -> Arc<Self> {
        let ctx = Self::bare();
        let local = LocalTransportFactory::new(Arc::downgrade(&ctx.registry));
        ctx.registry.register_transport(LOCAL_PROTOCOL, Arc::new(local));
        ctx.registry
            .register_transport(SOCKET_PROTOCOL, Arc::new(SocketTransportFactory));
        ctx
    }

    /// Context without any transport.
    pub fn bare() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<RemotingContext>| Self {
            registry: Arc::new(InvokerRegistry::new(weak.clone())),
            validators: ValidatorTable::new(),
        })
    }

    pub fn registry(&self) -> &Arc<InvokerRegistry> {
        &self.registry
    }

    pub fn validators(&self) -> &ValidatorTable {
        &self.validators
    }

    pub fn register_transport(&self, protocol: &str, factory: Arc<dyn TransportFactory>) {
        self.registry.register_transport(protocol, factory);
    }

    /// Destroy every server invoker of this context.
    pub fn shutdown(&self) {
        for invoker in self.registry.server_invokers() {
            self.registry.release_server_invoker(&invoker);
        }
        log::debug!("[context] shut down");
    }
}

impl std::fmt::Debug for RemotingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotingContext")
            .field("client_invokers", &self.registry.client_holder_count())
            .field("server_invokers", &self.registry.server_invokers().len())
            .field("validators", &self.validators.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::locator::Locator;

    #[test]
    fn default_transports_registered() {
        let ctx = RemotingContext::new();
        assert!(ctx.registry().is_transport_registered("local"));
        assert!(ctx.registry().is_transport_registered("SOCKET"));

        let bare = RemotingContext::bare();
        let err = bare
            .registry()
            .create_server_invoker(&Locator::parse("local://x:1").unwrap(), &Config::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownProtocol(_)));
    }

    #[test]
    fn shutdown_destroys_servers() {
        let ctx = RemotingContext::new();
        let server = ctx
            .registry()
            .create_server_invoker(&Locator::parse("local://shut:1").unwrap(), &Config::new())
            .unwrap();
        server.start().unwrap();
        ctx.shutdown();
        assert!(server.is_destroyed());
        assert!(ctx.registry().server_invokers().is_empty());
    }
}

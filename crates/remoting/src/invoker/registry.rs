// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Invoker registry.
//!
//! Client side: at most one live client invoker per (locator, config),
//! reference counted by the clients holding it. Server side: at most one
//! server invoker per locator.
//!
//! Each side is guarded by a single lock, so create/destroy for the same key
//! never interleave.

use super::{ClientInvoker, ClientTransport, TransportFactory};
use crate::config::{keys, Config};
use crate::context::RemotingContext;
use crate::error::{Error, Result};
use crate::locator::Locator;
use crate::scheduler::Task;
use crate::server::ServerInvoker;
use crate::transport::local::LocalClientTransport;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct ClientInvokerHolder {
    invoker: Arc<ClientInvoker>,
    config: Config,
    refcount: usize,
}

#[derive(Default)]
struct ServerTable {
    /// (creation locator, invoker). Creation locators are unique except for
    /// ephemeral (port 0) ones.
    invokers: Vec<(Locator, Arc<ServerInvoker>)>,
    /// Resolved locators (real ports), for peer discovery.
    registered: HashSet<Locator>,
}

impl ServerTable {
    /// Index by resolved locator first, then by creation locator.
    fn position(&self, locator: &Locator) -> Option<usize> {
        self.invokers
            .iter()
            .position(|(_, inv)| inv.locator() == *locator)
            .or_else(|| self.invokers.iter().position(|(created, _)| created == locator))
    }
}

/// Process-wide invoker bookkeeping, owned by a [`RemotingContext`].
pub struct InvokerRegistry {
    context: Weak<RemotingContext>,
    transports: RwLock<HashMap<String, Arc<dyn TransportFactory>>>,
    clients: Mutex<HashMap<Locator, Vec<ClientInvokerHolder>>>,
    servers: Mutex<ServerTable>,
    deferred: Mutex<Vec<Task>>,
}

impl InvokerRegistry {
    pub fn new(context: Weak<RemotingContext>) -> Self {
        Self {
            context,
            transports: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            servers: Mutex::new(ServerTable::default()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    // ========================================================================
    // Transports
    // ========================================================================

    /// Register (or replace) the factory for `protocol`.
    pub fn register_transport(&self, protocol: &str, factory: Arc<dyn TransportFactory>) {
        let protocol = protocol.to_ascii_lowercase();
        log::debug!("[registry] transport '{}' registered", protocol);
        self.transports.write().insert(protocol, factory);
    }

    pub fn unregister_transport(&self, protocol: &str) -> bool {
        self.transports
            .write()
            .remove(&protocol.to_ascii_lowercase())
            .is_some()
    }

    pub fn is_transport_registered(&self, protocol: &str) -> bool {
        self.transports
            .read()
            .contains_key(&protocol.to_ascii_lowercase())
    }

    fn factory(&self, protocol: &str) -> Result<Arc<dyn TransportFactory>> {
        self.transports
            .read()
            .get(protocol)
            .cloned()
            .ok_or_else(|| Error::UnknownProtocol(protocol.to_string()))
    }

    // ========================================================================
    // Client invokers
    // ========================================================================

    /// Shared client invoker for (`locator`, `config`).
    ///
    /// A matching holder's invoker is returned with its refcount bumped;
    /// otherwise a new invoker is built, over the in-process loopback when a
    /// local server serves the same endpoint (unless `forceRemote`).
    pub fn create_client_invoker(
        &self,
        locator: &Locator,
        config: &Config,
    ) -> Result<Arc<ClientInvoker>> {
        let mut clients = self.clients.lock();
        if let Some(holder) = clients
            .get_mut(locator)
            .and_then(|holders| holders.iter_mut().find(|h| h.config == *config))
        {
            holder.refcount += 1;
            log::trace!(
                "[registry] reusing client invoker for {} (refs {})",
                locator,
                holder.refcount
            );
            return Ok(Arc::clone(&holder.invoker));
        }

        let force_remote = config.get_bool(keys::FORCE_REMOTE, false)
            || locator.parameter(keys::FORCE_REMOTE) == Some("true");
        let local_server = if force_remote {
            None
        } else {
            self.find_local_server(locator)
        };

        let (transport, loopback): (Box<dyn ClientTransport>, bool) = match local_server {
            Some(server) => {
                log::debug!("[registry] {} served in-process, using loopback", locator);
                (
                    Box::new(LocalClientTransport::bound(locator.clone(), &server)),
                    true,
                )
            }
            None => (
                self.factory(locator.protocol())?
                    .create_client(locator, config)?,
                false,
            ),
        };

        let invoker = Arc::new(ClientInvoker::new(
            locator.clone(),
            config.clone(),
            transport,
            loopback,
        ));
        clients
            .entry(locator.clone())
            .or_default()
            .push(ClientInvokerHolder {
                invoker: Arc::clone(&invoker),
                config: config.clone(),
                refcount: 1,
            });
        log::debug!("[registry] client invoker created for {}", locator);
        Ok(invoker)
    }

    /// Drop one reference; the last one disconnects the invoker.
    pub fn destroy_client_invoker(&self, locator: &Locator, config: &Config) {
        let doomed = {
            let mut clients = self.clients.lock();
            let Some(holders) = clients.get_mut(locator) else {
                log::debug!("[registry] no client invoker for {}", locator);
                return;
            };
            let Some(idx) = holders.iter().position(|h| h.config == *config) else {
                log::debug!("[registry] no client invoker for {} with that config", locator);
                return;
            };
            holders[idx].refcount -= 1;
            if holders[idx].refcount > 0 {
                return;
            }
            let holder = holders.remove(idx);
            if holders.is_empty() {
                clients.remove(locator);
            }
            holder.invoker
        };
        log::debug!("[registry] last reference to {} released", locator);
        doomed.disconnect();
    }

    /// [`destroy_client_invoker`](Self::destroy_client_invoker) after `delay`.
    pub fn destroy_client_invoker_after(
        self: &Arc<Self>,
        locator: &Locator,
        config: &Config,
        delay: Duration,
    ) -> Result<()> {
        let weak = Arc::downgrade(self);
        let locator = locator.clone();
        let config = config.clone();
        let task = Task::once("invoker-destroy", delay, move || {
            if let Some(registry) = weak.upgrade() {
                registry.destroy_client_invoker(&locator, &config);
            }
        })?;
        let mut deferred = self.deferred.lock();
        deferred.retain(|t| !t.is_finished());
        deferred.push(task);
        Ok(())
    }

    /// Client invoker currently registered for (`locator`, `config`).
    pub fn client_invoker(&self, locator: &Locator, config: &Config) -> Option<Arc<ClientInvoker>> {
        self.clients
            .lock()
            .get(locator)
            .and_then(|holders| holders.iter().find(|h| h.config == *config))
            .map(|h| Arc::clone(&h.invoker))
    }

    pub fn client_refcount(&self, locator: &Locator, config: &Config) -> usize {
        self.clients
            .lock()
            .get(locator)
            .and_then(|holders| holders.iter().find(|h| h.config == *config))
            .map_or(0, |h| h.refcount)
    }

    /// Number of live client invoker holders.
    pub fn client_holder_count(&self) -> usize {
        self.clients.lock().values().map(Vec::len).sum()
    }

    // ========================================================================
    // Server invokers
    // ========================================================================

    /// Create (not start) the server invoker for `locator`.
    pub fn create_server_invoker(
        &self,
        locator: &Locator,
        config: &Config,
    ) -> Result<Arc<ServerInvoker>> {
        let mut servers = self.servers.lock();
        let ephemeral = locator.port() == Some(0);
        if !ephemeral && servers.position(locator).is_some() {
            return Err(Error::AlreadyBound(locator.to_string()));
        }
        let transport = self
            .factory(locator.protocol())?
            .create_server(locator, config)?;
        let invoker = ServerInvoker::new(
            locator.clone(),
            config.clone(),
            transport,
            self.context.clone(),
        );
        servers.invokers.push((locator.clone(), Arc::clone(&invoker)));
        log::debug!("[registry] server invoker created for {}", locator);
        Ok(invoker)
    }

    /// Record the locator a started server invoker actually listens on.
    pub fn register_server_locator(&self, resolved: &Locator) {
        self.servers.lock().registered.insert(resolved.clone());
    }

    /// Remove a server invoker by creation or resolved locator.
    pub fn destroy_server_invoker(&self, locator: &Locator) -> Option<Arc<ServerInvoker>> {
        let removed = {
            let mut servers = self.servers.lock();
            let invoker = servers
                .position(locator)
                .map(|idx| servers.invokers.remove(idx).1);
            if let Some(inv) = &invoker {
                servers.registered.remove(&inv.locator());
            }
            invoker
        };
        if let Some(invoker) = &removed {
            invoker.destroy();
            log::debug!("[registry] server invoker for {} destroyed", locator);
        }
        removed
    }

    /// Remove and destroy this exact server invoker.
    pub fn release_server_invoker(&self, invoker: &Arc<ServerInvoker>) -> bool {
        let found = {
            let mut servers = self.servers.lock();
            match servers
                .invokers
                .iter()
                .position(|(_, inv)| Arc::ptr_eq(inv, invoker))
            {
                Some(idx) => {
                    servers.invokers.remove(idx);
                    servers.registered.remove(&invoker.locator());
                    true
                }
                None => false,
            }
        };
        invoker.destroy();
        if found {
            log::debug!("[registry] server invoker for {} released", invoker.locator());
        }
        found
    }

    /// Server invoker by creation or resolved locator.
    pub fn server_invoker(&self, locator: &Locator) -> Option<Arc<ServerInvoker>> {
        let servers = self.servers.lock();
        servers
            .position(locator)
            .map(|idx| Arc::clone(&servers.invokers[idx].1))
    }

    pub fn is_server_registered(&self, locator: &Locator) -> bool {
        self.server_invoker(locator).is_some()
    }

    /// Resolved locators of started server invokers.
    pub fn registered_locators(&self) -> Vec<Locator> {
        self.servers.lock().registered.iter().cloned().collect()
    }

    pub fn server_invokers(&self) -> Vec<Arc<ServerInvoker>> {
        self.servers
            .lock()
            .invokers
            .iter()
            .map(|(_, inv)| Arc::clone(inv))
            .collect()
    }

    /// Started in-process server for the same endpoint as `locator`.
    pub fn find_local_server(&self, locator: &Locator) -> Option<Arc<ServerInvoker>> {
        self.servers
            .lock()
            .invokers
            .iter()
            .map(|(_, inv)| inv)
            .find(|inv| inv.is_started() && inv.locator().is_same_endpoint(locator))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RemotingContext;

    fn locator(uri: &str) -> Locator {
        Locator::parse(uri).unwrap()
    }

    #[test]
    fn refcounted_client_invokers() {
        let ctx = RemotingContext::new();
        let registry = ctx.registry();
        let loc = locator("socket://127.0.0.1:1");
        let cfg = Config::new().with("timeout", 100);

        let first = registry.create_client_invoker(&loc, &cfg).unwrap();
        let second = registry.create_client_invoker(&loc, &cfg).unwrap();
        let third = registry.create_client_invoker(&loc, &cfg).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(registry.client_refcount(&loc, &cfg), 3);

        registry.destroy_client_invoker(&loc, &cfg);
        registry.destroy_client_invoker(&loc, &cfg);
        assert_eq!(registry.client_holder_count(), 1);
        registry.destroy_client_invoker(&loc, &cfg);
        assert_eq!(registry.client_holder_count(), 0);

        let fresh = registry.create_client_invoker(&loc, &cfg).unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
    }

    #[test]
    fn configs_select_distinct_holders() {
        let ctx = RemotingContext::new();
        let registry = ctx.registry();
        let loc = locator("socket://127.0.0.1:2");

        let plain = registry.create_client_invoker(&loc, &Config::new()).unwrap();
        let tuned = registry
            .create_client_invoker(&loc, &Config::new().with("timeout", 5))
            .unwrap();
        assert!(!Arc::ptr_eq(&plain, &tuned));
        assert_eq!(registry.client_holder_count(), 2);
    }

    #[test]
    fn unknown_protocol() {
        let ctx = RemotingContext::new();
        let err = ctx
            .registry()
            .create_client_invoker(&locator("carrier-pigeon://coop:1"), &Config::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownProtocol(_)));
    }

    #[test]
    fn duplicate_server_locator_rejected() {
        let ctx = RemotingContext::new();
        let registry = ctx.registry();
        let loc = locator("local://dup-test:1");
        registry.create_server_invoker(&loc, &Config::new()).unwrap();
        let err = registry
            .create_server_invoker(&loc, &Config::new())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyBound(_)));

        assert!(registry.destroy_server_invoker(&loc).is_some());
        assert!(registry.create_server_invoker(&loc, &Config::new()).is_ok());
    }

    #[test]
    fn loopback_chosen_for_local_server_unless_forced_remote() {
        let ctx = RemotingContext::new();
        let registry = ctx.registry();
        let server_loc = locator("socket://127.0.0.1:0");
        let server = registry
            .create_server_invoker(&server_loc, &Config::new())
            .unwrap();
        let resolved = server.start().unwrap();

        let client_loc = resolved.with_path("service");
        let local = registry
            .create_client_invoker(&client_loc, &Config::new())
            .unwrap();
        assert!(local.is_loopback());

        let remote = registry
            .create_client_invoker(&client_loc, &Config::new().with(keys::FORCE_REMOTE, true))
            .unwrap();
        assert!(!remote.is_loopback());
        assert!(registry.registered_locators().contains(&resolved));

        registry.destroy_server_invoker(&resolved);
        assert!(registry.registered_locators().is_empty());
    }

    #[test]
    fn deferred_destroy() {
        let ctx = RemotingContext::new();
        let registry = ctx.registry();
        let loc = locator("socket://127.0.0.1:3");
        registry.create_client_invoker(&loc, &Config::new()).unwrap();
        registry
            .destroy_client_invoker_after(&loc, &Config::new(), Duration::from_millis(30))
            .unwrap();
        assert_eq!(registry.client_holder_count(), 1);
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(registry.client_holder_count(), 0);
    }
}

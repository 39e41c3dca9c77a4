// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side lifecycle facade.
//!
//! A [`Connector`] owns one server invoker registered in the context's
//! registry: it creates it on demand, starts it, and unregisters it on stop
//! (or drop).

use crate::config::Config;
use crate::context::RemotingContext;
use crate::error::{Error, Result};
use crate::locator::Locator;
use crate::notifier::ConnectionListener;
use crate::server::{ServerInvocationHandler, ServerInvoker};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct Connector {
    context: Arc<RemotingContext>,
    locator: Locator,
    config: Config,
    invoker: Mutex<Option<Arc<ServerInvoker>>>,
}

impl Connector {
    /// Connector for `locator`; `config` is merged with the locator's
    /// parameters.
    pub fn new(context: Arc<RemotingContext>, locator: &Locator, config: Config) -> Self {
        let config = Config::resolve(locator.parameters(), &config);
        Self {
            context,
            locator: locator.clone(),
            config,
            invoker: Mutex::new(None),
        }
    }

    /// Create the server invoker without starting it. Idempotent.
    pub fn create(&self) -> Result<Arc<ServerInvoker>> {
        let mut slot = self.invoker.lock();
        if let Some(invoker) = slot.as_ref() {
            return Ok(Arc::clone(invoker));
        }
        let invoker = self
            .context
            .registry()
            .create_server_invoker(&self.locator, &self.config)?;
        *slot = Some(Arc::clone(&invoker));
        Ok(invoker)
    }

    /// Create if needed and start; returns the locator clients should use.
    pub fn start(&self) -> Result<Locator> {
        let invoker = self.create()?;
        invoker.start()
    }

    /// Stop and unregister the server invoker. Idempotent.
    pub fn stop(&self) {
        let Some(invoker) = self.invoker.lock().take() else {
            return;
        };
        self.context.registry().release_server_invoker(&invoker);
        log::debug!("[connector] {} stopped", invoker.locator());
    }

    pub fn is_started(&self) -> bool {
        self.invoker
            .lock()
            .as_ref()
            .is_some_and(|inv| inv.is_started())
    }

    /// Resolved locator once started, the requested one before.
    pub fn locator(&self) -> Locator {
        self.invoker
            .lock()
            .as_ref()
            .map_or_else(|| self.locator.clone(), |inv| inv.locator())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server_invoker(&self) -> Option<Arc<ServerInvoker>> {
        self.invoker.lock().clone()
    }

    pub fn add_invocation_handler(
        &self,
        subsystem: &str,
        handler: Arc<dyn ServerInvocationHandler>,
    ) -> Result<()> {
        let invoker = self.create()?;
        if invoker.add_invocation_handler(subsystem, handler).is_some() {
            log::debug!("[connector] handler for {} replaced", subsystem);
        }
        Ok(())
    }

    pub fn remove_invocation_handler(&self, subsystem: &str) -> bool {
        self.server_invoker()
            .is_some_and(|inv| inv.remove_invocation_handler(subsystem).is_some())
    }

    /// Listener told when a client's lease is lost or terminated.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> Result<bool> {
        let invoker = self.create()?;
        Ok(invoker.add_connection_listener(listener))
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> Result<bool> {
        let invoker = self
            .server_invoker()
            .ok_or_else(|| Error::InvalidState("connector has no server invoker".into()))?;
        Ok(invoker.remove_connection_listener(listener))
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("locator", &self.locator())
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stop_unregisters() {
        let ctx = RemotingContext::new();
        let connector = Connector::new(
            Arc::clone(&ctx),
            &Locator::parse("local://conn-test:0").unwrap(),
            Config::new(),
        );
        assert!(!connector.is_started());
        let resolved = connector.start().unwrap();
        assert!(connector.is_started());
        assert_eq!(connector.locator(), resolved);
        assert!(ctx.registry().is_server_registered(&resolved));

        connector.stop();
        connector.stop();
        assert!(!ctx.registry().is_server_registered(&resolved));
        assert!(ctx.registry().registered_locators().is_empty());
    }

    #[test]
    fn locator_parameters_reach_server_config() {
        let ctx = RemotingContext::new();
        let connector = Connector::new(
            Arc::clone(&ctx),
            &Locator::parse("local://conn-params:1/?clientLeasePeriod=250").unwrap(),
            Config::new(),
        );
        let invoker = connector.create().unwrap();
        assert_eq!(invoker.config().get("clientLeasePeriod"), Some("250"));
        assert!(!invoker.is_leasing_enabled());

        let listener: Arc<dyn ConnectionListener> =
            Arc::new(|_: Option<&Error>, _: &crate::invocation::ClientHolder| {});
        assert!(connector.add_connection_listener(Arc::clone(&listener)).unwrap());
        assert!(invoker.is_leasing_enabled());
        assert!(connector.remove_connection_listener(&listener).unwrap());
    }

    #[test]
    fn dropping_connector_releases_locator() {
        let ctx = RemotingContext::new();
        let loc = Locator::parse("local://conn-drop:3").unwrap();
        {
            let connector = Connector::new(Arc::clone(&ctx), &loc, Config::new());
            connector.start().unwrap();
            assert!(Connector::new(Arc::clone(&ctx), &loc, Config::new())
                .start()
                .is_err());
        }
        let again = Connector::new(Arc::clone(&ctx), &loc, Config::new());
        assert!(again.start().is_ok());
    }
}

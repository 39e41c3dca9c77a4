// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # remoting - pluggable RPC runtime
//!
//! Transport-agnostic client/server invocation with callback delivery and
//! session keepalive ("lease") management.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use remoting::{Client, Config, Connector, Locator, RemotingContext, Result};
//! use remoting::invocation::{InvocationRequest, Payload, RemoteFault};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let ctx = RemotingContext::new();
//!
//!     let bind = Locator::parse("socket://127.0.0.1:0")?;
//!     let connector = Connector::new(Arc::clone(&ctx), &bind, Config::new());
//!     let handler = |req: &InvocationRequest| -> std::result::Result<Value, RemoteFault> {
//!         match &req.payload {
//!             Payload::Data(v) => Ok(json!({ "echo": v })),
//!             _ => Err(RemoteFault::application("unexpected payload")),
//!         }
//!     };
//!     connector.add_invocation_handler("echo", Arc::new(handler))?;
//!     let locator = connector.start()?;
//!
//!     let client = Client::new(ctx, &locator, Config::new())?.with_subsystem("echo");
//!     client.connect()?;
//!     let answer = client.invoke(json!("hello"), None)?;
//!     println!("{}", answer);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |   Client (facade)                     Connector (facade)            |
//! |   listeners | validators | oneway      handlers | connection lsnrs |
//! +---------------------------------------------------------------------+
//! |   InvokerRegistry (shared, refcounted client invokers)              |
//! |   ClientInvoker + LeasePinger  <---->  ServerInvoker + Lease        |
//! +---------------------------------------------------------------------+
//! |   Transports: local (in-process loopback) | socket (TCP frames)    |
//! +---------------------------------------------------------------------+
//! ```
//!
//! Nothing is global: every client and connector is built against a
//! [`RemotingContext`], which owns the registry and the validator table.

pub mod client;
/// Configuration map and option keys.
pub mod config;
/// Server lifecycle facade.
pub mod connector;
/// Composition root.
pub mod context;
pub mod error;
/// Invocation envelopes, commands and faults.
pub mod invocation;
/// Client invokers, transport traits and the invoker registry.
pub mod invoker;
/// Server-side leases.
pub mod lease;
/// Endpoint addressing.
pub mod locator;
/// Connection loss fan-out.
pub mod notifier;
/// Client-side lease keepalive.
pub mod pinger;
pub mod scheduler;
/// Server invoker and its callback handlers.
pub mod server;
/// Reference transports.
pub mod transport;
/// Client-side connection validation.
pub mod validator;
pub mod worker_pool;

pub use client::{CallbackHandler, Client};
pub use config::{keys, Config, DisconnectTimeout};
pub use connector::Connector;
pub use context::RemotingContext;
pub use error::{Error, Result};
pub use invocation::{Callback, ClientHolder, InvocationRequest, InvocationResponse, RemoteFault};
pub use locator::Locator;
pub use notifier::ConnectionListener;
pub use server::callback::{CallbackAckListener, ServerInvokerCallbackHandler};
pub use server::{ServerInvocationHandler, ServerInvoker};
pub use validator::ConnectionValidator;

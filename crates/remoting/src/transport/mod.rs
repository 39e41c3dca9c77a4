// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Built-in transports.
//!
//! - `local`: in-process loopback, no serialization.
//! - `socket`: blocking TCP with length-prefixed JSON frames.
//!
//! Both are registered by [`RemotingContext::new`](crate::RemotingContext::new);
//! the core only talks to them through the traits in [`crate::invoker`].

pub mod local;
pub mod socket;

pub use local::LocalTransportFactory;
pub use socket::SocketTransportFactory;

/// Protocol name of the loopback transport.
pub const LOCAL_PROTOCOL: &str = "local";
/// Protocol name of the TCP transport.
pub const SOCKET_PROTOCOL: &str = "socket";

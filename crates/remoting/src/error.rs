// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the remoting runtime.
//!
//! Variants are grouped by how callers are expected to react:
//!
//! - **Connectivity** faults mean the peer could not be reached. They are never
//!   retried inline; the lease pinger and connection validator retry on their
//!   own schedule.
//! - **State** faults mean the invoker is not started or already stopped.
//! - **Configuration** faults are fatal and surfaced immediately.
//! - **Remote** faults carry a handler failure from the other side, or the
//!   distinguished "client disconnected normally" cause.

use crate::invocation::{FaultKind, RemoteFault};
use std::fmt;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Remoting error.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Connectivity
    // ========================================================================
    /// Could not reach the peer (connect refused, dead socket, ping timeout).
    CannotConnect { locator: String, reason: String },
    /// Transport failure in the middle of an invocation.
    Transport(String),
    /// The call did not complete in time.
    Timeout(String),
    /// The client or invoker has not been connected.
    NotConnected,

    // ========================================================================
    // State
    // ========================================================================
    /// Invoker not started, already stopped, or destroyed.
    InvalidState(String),

    // ========================================================================
    // Configuration
    // ========================================================================
    /// Invalid or inconsistent configuration value.
    Configuration(String),
    /// Locator string could not be parsed.
    InvalidLocator(String),
    /// A server invoker is already registered for this locator.
    AlreadyBound(String),
    /// No transport factory registered for the protocol.
    UnknownProtocol(String),
    /// No invocation handler for the requested subsystem.
    NoHandler(Option<String>),

    // ========================================================================
    // Remote
    // ========================================================================
    /// The remote handler failed; carries remote and local context frames.
    RemoteApplication(RemoteFault),
    /// The peer ended its session on purpose.
    ClientDisconnected,

    // ========================================================================
    // Local validation and codec
    // ========================================================================
    /// Caller supplied arguments that fail validation.
    Validation(String),
    /// Envelope could not be encoded or decoded.
    Serialization(String),
    /// I/O error with underlying cause.
    Io(std::io::Error),
}

impl Error {
    /// Shorthand for a connect failure against `locator`.
    pub fn cannot_connect(locator: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::CannotConnect {
            locator: locator.to_string(),
            reason: reason.into(),
        }
    }

    /// True for faults meaning the peer is unreachable.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::CannotConnect { .. }
                | Error::Transport(_)
                | Error::Timeout(_)
                | Error::NotConnected
                | Error::Io(_)
        )
    }

    /// True for the distinguished planned-disconnect cause.
    pub fn is_disconnected_normally(&self) -> bool {
        matches!(self, Error::ClientDisconnected)
    }

    /// Rebuild a local error from a fault carried in a response envelope.
    pub(crate) fn from_fault(fault: RemoteFault) -> Self {
        match fault.kind {
            FaultKind::Application => Error::RemoteApplication(fault),
            FaultKind::InvalidState => Error::InvalidState(fault.message),
            FaultKind::Configuration => Error::Configuration(fault.message),
            FaultKind::NoHandler => Error::NoHandler(fault.subsystem),
            FaultKind::Validation => Error::Validation(fault.message),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Connectivity
            Error::CannotConnect { locator, reason } => {
                write!(f, "Could not connect to {}: {}", locator, reason)
            }
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::Timeout(msg) => write!(f, "Timed out: {}", msg),
            Error::NotConnected => write!(f, "Not connected"),
            // State
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            // Configuration
            Error::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Error::InvalidLocator(msg) => write!(f, "Invalid locator: {}", msg),
            Error::AlreadyBound(locator) => {
                write!(f, "A server invoker is already bound to {}", locator)
            }
            Error::UnknownProtocol(p) => write!(f, "No transport registered for '{}'", p),
            Error::NoHandler(Some(subsystem)) => {
                write!(f, "No handler registered for subsystem {}", subsystem)
            }
            Error::NoHandler(None) => {
                write!(f, "No subsystem given and more than one handler registered")
            }
            // Remote
            Error::RemoteApplication(fault) => write!(f, "Remote fault: {}", fault),
            Error::ClientDisconnected => write!(f, "Client disconnected normally"),
            // Validation and codec
            Error::Validation(msg) => write!(f, "Validation failed: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Error::Timeout(e.to_string())
            }
            _ => Error::Io(e),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Invocation and response envelopes.
//!
//! Everything that crosses the client/server boundary is one of these types.
//! The socket transport sends them as JSON; the loopback transport hands them
//! over as values.
//!
//! ```text
//! InvocationRequest { session_id, subsystem, payload, request_metadata,
//!                     return_metadata, origin_locator }
//!        |
//!        v                 Payload::Command   -> reserved "$PING$" etc.
//!   ServerInvoker          Payload::Oneway    -> worker pool, no result
//!        |                 Payload::Internal  -> listener / callback table
//!        v                 Payload::Data      -> subsystem handler
//! InvocationResponse { session_id, result: value | fault, return_metadata }
//! ```

use crate::client::CallbackHandler;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::locator::Locator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// String metadata attached to requests and responses.
pub type Metadata = BTreeMap<String, String>;

/// Well-known metadata keys.
pub mod meta {
    /// JSON list of [`ClientHolder`](super::ClientHolder)s on a lease ping.
    pub const CLIENT_HOLDERS: &str = "clientHolders";
    /// Lease period (ms) requested by the pinger.
    pub const LEASE_PERIOD: &str = "leasePeriod";
    /// Monotonic pinger timestamp.
    pub const TIME_STAMP: &str = "timeStamp";
    /// Identity of the pinger that sent the ping.
    pub const LEASE_PINGER_ID: &str = "leasePingerId";
    /// Asks "is the lease for this invoker session still alive?".
    pub const INVOKER_SESSION_ID: &str = "invokerSessionId";
    /// Client session being disconnected (per-client `$DISCONNECT$`).
    pub const CLIENT_SESSION_ID: &str = "clientSessionId";
    /// Per-call timeout (ms).
    pub const TIMEOUT: &str = "timeout";
}

// ============================================================================
// Reserved commands
// ============================================================================

/// Reserved requests intercepted before subsystem dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    #[serde(rename = "$PING$")]
    Ping,
    #[serde(rename = "$DISCONNECT$")]
    Disconnect,
    #[serde(rename = "$GET_CLIENT_LOCAL_ADDRESS$")]
    GetClientLocalAddress,
    #[serde(rename = "$ECHO$")]
    Echo,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Ping => "$PING$",
            Command::Disconnect => "$DISCONNECT$",
            Command::GetClientLocalAddress => "$GET_CLIENT_LOCAL_ADDRESS$",
            Command::Echo => "$ECHO$",
        }
    }

    pub fn parse(s: &str) -> Option<Command> {
        match s {
            "$PING$" => Some(Command::Ping),
            "$DISCONNECT$" => Some(Command::Disconnect),
            "$GET_CLIENT_LOCAL_ADDRESS$" => Some(Command::GetClientLocalAddress),
            "$ECHO$" => Some(Command::Echo),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Internal invocations
// ============================================================================

/// Callback handler riding along an `ADDCLIENTLISTENER` over the loopback.
///
/// Never serialized; a request that crossed the wire carries `None`.
#[derive(Clone, Default)]
pub struct LocalHandler(pub Option<Arc<dyn CallbackHandler>>);

impl fmt::Debug for LocalHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("LocalHandler(<handler>)"),
            None => f.write_str("LocalHandler(None)"),
        }
    }
}

/// Listener and callback management requests.
///
/// Tagged on the wire by `method` (`ADDLISTENER`, `GETCALLBACKS`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "UPPERCASE")]
pub enum InternalInvocation {
    /// Register a server-side callback handler; push when a locator is given.
    AddListener {
        listener_id: String,
        #[serde(default)]
        callback_locator: Option<Locator>,
    },
    RemoveListener {
        listener_id: String,
    },
    /// Drain queued pull callbacks.
    GetCallbacks {
        listener_id: String,
    },
    AcknowledgeCallback {
        listener_id: String,
        callback_ids: Vec<String>,
        #[serde(default)]
        responses: Option<Vec<Value>>,
    },
    /// Register a client-local handler on a callback server.
    AddClientListener {
        listener_id: String,
        #[serde(default)]
        handle_object: Option<Value>,
        #[serde(skip)]
        handler: LocalHandler,
    },
    RemoveClientListener {
        listener_id: String,
    },
    /// Hand the handler a stream served at `stream_locator`.
    AddStreamCallback {
        stream_locator: Locator,
        #[serde(default)]
        payload: Value,
    },
    /// Server-to-client callback delivery on a callback server.
    HandleCallback {
        callback: Callback,
    },
    Echo {
        #[serde(default)]
        value: Value,
    },
}

impl InternalInvocation {
    /// Wire name of the method.
    pub fn method(&self) -> &'static str {
        match self {
            InternalInvocation::AddListener { .. } => "ADDLISTENER",
            InternalInvocation::RemoveListener { .. } => "REMOVELISTENER",
            InternalInvocation::GetCallbacks { .. } => "GETCALLBACKS",
            InternalInvocation::AcknowledgeCallback { .. } => "ACKNOWLEDGECALLBACK",
            InternalInvocation::AddClientListener { .. } => "ADDCLIENTLISTENER",
            InternalInvocation::RemoveClientListener { .. } => "REMOVECLIENTLISTENER",
            InternalInvocation::AddStreamCallback { .. } => "ADDSTREAMCALLBACK",
            InternalInvocation::HandleCallback { .. } => "HANDLECALLBACK",
            InternalInvocation::Echo { .. } => "ECHO",
        }
    }
}

// ============================================================================
// Payload
// ============================================================================

/// What a request asks the server to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Application data for a subsystem handler.
    Data(Value),
    Command(Command),
    Internal(InternalInvocation),
    /// Executed off the request thread; the caller gets no result.
    Oneway(Box<Payload>),
}

impl Payload {
    /// Reserved command, also recognized when sent as a plain string.
    pub fn as_command(&self) -> Option<Command> {
        match self {
            Payload::Command(cmd) => Some(*cmd),
            Payload::Data(Value::String(s)) => Command::parse(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn oneway(self) -> Payload {
        match self {
            Payload::Oneway(_) => self,
            other => Payload::Oneway(Box::new(other)),
        }
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Data(v)
    }
}

impl From<Command> for Payload {
    fn from(c: Command) -> Self {
        Payload::Command(c)
    }
}

impl From<InternalInvocation> for Payload {
    fn from(i: InternalInvocation) -> Self {
        Payload::Internal(i)
    }
}

// ============================================================================
// Request / response
// ============================================================================

/// Invocation envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub session_id: String,
    #[serde(default)]
    pub subsystem: Option<String>,
    pub payload: Payload,
    #[serde(default)]
    pub request_metadata: Metadata,
    #[serde(default)]
    pub return_metadata: Metadata,
    #[serde(default)]
    pub origin_locator: Option<Locator>,
    /// Remote address as seen by the server transport.
    #[serde(skip)]
    pub peer_address: Option<SocketAddr>,
}

impl InvocationRequest {
    pub fn new(session_id: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            session_id: session_id.into(),
            subsystem: None,
            payload: payload.into(),
            request_metadata: Metadata::new(),
            return_metadata: Metadata::new(),
            origin_locator: None,
            peer_address: None,
        }
    }

    #[must_use]
    pub fn with_subsystem(mut self, subsystem: Option<String>) -> Self {
        self.subsystem = subsystem;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.request_metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl ToString) -> Self {
        self.request_metadata.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_origin(mut self, locator: Option<Locator>) -> Self {
        self.origin_locator = locator;
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_meta(meta::TIMEOUT, timeout.as_millis())
    }

    /// Per-call timeout carried in metadata.
    pub fn timeout(&self) -> Option<Duration> {
        self.request_metadata
            .get(meta::TIMEOUT)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    pub fn is_oneway(&self) -> bool {
        matches!(self.payload, Payload::Oneway(_))
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.request_metadata.get(key).map(String::as_str)
    }
}

/// Result half of a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBody {
    Value(Value),
    Fault(RemoteFault),
}

/// Response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub session_id: String,
    pub result: ResponseBody,
    #[serde(default)]
    pub return_metadata: Metadata,
}

impl InvocationResponse {
    pub fn value(session_id: impl Into<String>, value: Value) -> Self {
        Self {
            session_id: session_id.into(),
            result: ResponseBody::Value(value),
            return_metadata: Metadata::new(),
        }
    }

    pub fn fault(session_id: impl Into<String>, fault: RemoteFault) -> Self {
        Self {
            session_id: session_id.into(),
            result: ResponseBody::Fault(fault),
            return_metadata: Metadata::new(),
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self.result, ResponseBody::Fault(_))
    }

    /// Unwrap into a value, rebuilding a local error for faults.
    pub fn into_result(self) -> Result<Value> {
        match self.result {
            ResponseBody::Value(v) => Ok(v),
            ResponseBody::Fault(fault) => Err(Error::from_fault(fault)),
        }
    }
}

// ============================================================================
// Faults
// ============================================================================

/// Category of a fault carried in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Application,
    InvalidState,
    Configuration,
    NoHandler,
    Validation,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Application => "application",
            FaultKind::InvalidState => "invalid state",
            FaultKind::Configuration => "configuration",
            FaultKind::NoHandler => "no handler",
            FaultKind::Validation => "validation",
        };
        f.write_str(name)
    }
}

/// Frame separating server context from client context in a stitched fault.
pub const CLIENT_MARKER_FRAME: &str = "--- client side ---";

/// Failure raised on the far side of an invocation.
///
/// `remote_frames` is filled where the fault happened; `local_frames` is
/// appended by the side that re-raises it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub message: String,
    #[serde(default)]
    pub subsystem: Option<String>,
    #[serde(default)]
    pub remote_frames: Vec<String>,
    #[serde(default)]
    pub local_frames: Vec<String>,
}

impl RemoteFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            subsystem: None,
            remote_frames: Vec::new(),
            local_frames: Vec::new(),
        }
    }

    /// Handler failure.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Application, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Validation, message)
    }

    #[must_use]
    pub fn with_subsystem(mut self, subsystem: Option<String>) -> Self {
        self.subsystem = subsystem;
        self
    }

    /// Record where the fault was raised.
    #[must_use]
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.remote_frames.push(frame.into());
        self
    }

    /// Map a local error to the fault sent back to the caller.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::RemoteApplication(fault) => fault.clone(),
            Error::InvalidState(msg) => Self::new(FaultKind::InvalidState, msg.clone()),
            Error::Configuration(_)
            | Error::InvalidLocator(_)
            | Error::AlreadyBound(_)
            | Error::UnknownProtocol(_) => Self::new(FaultKind::Configuration, err.to_string()),
            Error::NoHandler(subsystem) => Self::new(FaultKind::NoHandler, err.to_string())
                .with_subsystem(subsystem.clone()),
            Error::Validation(msg) => Self::new(FaultKind::Validation, msg.clone()),
            other => Self::application(other.to_string()),
        }
    }

    /// Append the client marker frame and the client-side context.
    #[must_use]
    pub fn stitch(mut self, local_frame: impl Into<String>) -> Self {
        self.local_frames.push(CLIENT_MARKER_FRAME.to_string());
        self.local_frames.push(local_frame.into());
        self
    }

    /// Server frames followed by client frames.
    pub fn frames(&self) -> impl Iterator<Item = &str> {
        self.remote_frames
            .iter()
            .chain(self.local_frames.iter())
            .map(String::as_str)
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fault: {}", self.kind, self.message)?;
        if let Some(subsystem) = &self.subsystem {
            write!(f, " (subsystem {})", subsystem)?;
        }
        for frame in self.frames() {
            write!(f, "\n    at {}", frame)?;
        }
        Ok(())
    }
}

impl From<Error> for RemoteFault {
    fn from(err: Error) -> Self {
        RemoteFault::from_error(&err)
    }
}

// ============================================================================
// Callbacks and lease bookkeeping
// ============================================================================

/// Server-to-client notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callback {
    pub payload: Value,
    #[serde(default)]
    pub handle_object: Option<Value>,
    #[serde(default)]
    pub server_locator: Option<Locator>,
    #[serde(default)]
    pub listener_id: String,
    /// Set when the server wants an acknowledgement.
    #[serde(default)]
    pub callback_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Callback {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            handle_object: None,
            server_locator: None,
            listener_id: String::new(),
            callback_id: None,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One logical client sharing a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHolder {
    pub session_id: String,
    pub lease_period_ms: u64,
    #[serde(default)]
    pub config: Config,
}

impl ClientHolder {
    pub fn new(session_id: impl Into<String>, lease_period: Duration, config: Config) -> Self {
        Self {
            session_id: session_id.into(),
            lease_period_ms: lease_period.as_millis() as u64,
            config,
        }
    }

    pub fn lease_period(&self) -> Duration {
        Duration::from_millis(self.lease_period_ms)
    }

    /// Encode a holder snapshot for request metadata.
    pub fn encode_list<'a>(holders: impl IntoIterator<Item = &'a ClientHolder>) -> Result<String> {
        let list: Vec<&ClientHolder> = holders.into_iter().collect();
        Ok(serde_json::to_string(&list)?)
    }

    pub fn decode_list(raw: &str) -> Result<Vec<ClientHolder>> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Server answer to a plain `$PING$`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub leasing_enabled: bool,
    pub lease_period_ms: u64,
}

impl PingResponse {
    pub fn lease_period(&self) -> Duration {
        Duration::from_millis(self.lease_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_recognized_as_plain_strings() {
        assert_eq!(Payload::Data(json!("$PING$")).as_command(), Some(Command::Ping));
        assert_eq!(
            Payload::Command(Command::Disconnect).as_command(),
            Some(Command::Disconnect)
        );
        assert_eq!(Payload::Data(json!("PING")).as_command(), None);
        assert_eq!(
            serde_json::to_value(Command::GetClientLocalAddress).unwrap(),
            json!("$GET_CLIENT_LOCAL_ADDRESS$")
        );
    }

    #[test]
    fn internal_invocations_tagged_by_method() {
        let inv = InternalInvocation::AcknowledgeCallback {
            listener_id: "l1".into(),
            callback_ids: vec!["a".into(), "b".into()],
            responses: None,
        };
        let wire = serde_json::to_value(&inv).unwrap();
        assert_eq!(wire["method"], "ACKNOWLEDGECALLBACK");
        assert_eq!(inv.method(), "ACKNOWLEDGECALLBACK");

        let back: InternalInvocation = serde_json::from_value(wire).unwrap();
        assert!(matches!(
            back,
            InternalInvocation::AcknowledgeCallback { ref callback_ids, .. } if callback_ids.len() == 2
        ));
    }

    #[test]
    fn local_handler_does_not_cross_the_wire() {
        let inv = InternalInvocation::AddClientListener {
            listener_id: "l".into(),
            handle_object: Some(json!(7)),
            handler: LocalHandler::default(),
        };
        let wire = serde_json::to_string(&inv).unwrap();
        assert!(!wire.contains("handler\""));
        let back: InternalInvocation = serde_json::from_str(&wire).unwrap();
        match back {
            InternalInvocation::AddClientListener { handler, handle_object, .. } => {
                assert!(handler.0.is_none());
                assert_eq!(handle_object, Some(json!(7)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn request_timeout_metadata() {
        let req = InvocationRequest::new("s", json!(1)).with_timeout(Duration::from_millis(250));
        assert_eq!(req.timeout(), Some(Duration::from_millis(250)));
        assert!(!req.is_oneway());
        let req = InvocationRequest::new("s", Payload::from(json!(1)).oneway());
        assert!(req.is_oneway());
    }

    #[test]
    fn fault_stitching_keeps_server_frames_first() {
        let fault = RemoteFault::application("bad input")
            .with_frame("handler ECHO")
            .stitch("Client::invoke");
        let frames: Vec<&str> = fault.frames().collect();
        assert_eq!(frames, vec!["handler ECHO", CLIENT_MARKER_FRAME, "Client::invoke"]);
    }

    #[test]
    fn fault_response_round_trip_to_error() {
        let resp = InvocationResponse::fault(
            "s",
            RemoteFault::from_error(&Error::NoHandler(Some("X".into()))),
        );
        assert!(resp.is_fault());
        match resp.into_result() {
            Err(Error::NoHandler(Some(s))) => assert_eq!(s, "X"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn holder_list_encoding() {
        let holders = vec![
            ClientHolder::new("a", Duration::from_millis(100), Config::new()),
            ClientHolder::new("b", Duration::from_millis(200), Config::new().with("k", "v")),
        ];
        let raw = ClientHolder::encode_list(&holders).unwrap();
        assert_eq!(ClientHolder::decode_list(&raw).unwrap(), holders);
    }
}

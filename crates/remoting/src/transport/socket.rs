// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking TCP transport.
//!
//! Wire format, one envelope per frame:
//!
//! ```text
//! +----------------+---------------------------------------+
//! | Length (4B BE) | JSON InvocationRequest / Response     |
//! +----------------+---------------------------------------+
//! ```
//!
//! Server: one accept thread plus one thread per connection; requests on a
//! connection are answered in order, oneway requests get no answer.
//! Client: a small pool of idle connections; a connection that failed is
//! dropped, never returned to the pool.

use crate::config::{keys, Config, DEFAULT_TIMEOUT};
use crate::error::{Error, Result};
use crate::invocation::{InvocationRequest, InvocationResponse};
use crate::invoker::{ClientTransport, ServerTransport, TransportFactory};
use crate::locator::{Home, Locator};
use crate::server::ServerInvoker;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Largest frame accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Idle client connections kept per transport.
const MAX_IDLE_CONNECTIONS: usize = 8;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Factory for `socket://` locators.
#[derive(Debug, Default)]
pub struct SocketTransportFactory;

impl TransportFactory for SocketTransportFactory {
    fn create_client(&self, locator: &Locator, config: &Config) -> Result<Box<dyn ClientTransport>> {
        Ok(Box::new(SocketClientTransport::new(locator, config)))
    }

    fn create_server(&self, locator: &Locator, _config: &Config) -> Result<Box<dyn ServerTransport>> {
        Ok(Box::new(SocketServerTransport::new(locator)))
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Write one length-prefixed JSON frame.
pub fn write_frame<W: Write, T: Serialize>(stream: &mut W, msg: &T) -> Result<()> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::Transport(format!(
            "frame too large: {} > {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = body.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame; `Ok(None)` when the peer closed between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(stream: &mut R) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(Error::Transport("empty frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::Transport(format!(
            "frame too large: {} > {}",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(Some(serde_json::from_slice(&body)?))
}

fn resolve(home: &Home) -> Result<SocketAddr> {
    let port = home.port.unwrap_or(0);
    (home.host.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::InvalidLocator(format!("{} resolves to no address", home)))
}

fn tune(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_keepalive(true) {
        log::trace!("[socket] keepalive not set: {}", e);
    }
    if let Err(e) = stream.set_nodelay(true) {
        log::trace!("[socket] nodelay not set: {}", e);
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client side of the TCP transport.
pub struct SocketClientTransport {
    locator: Locator,
    timeout: Duration,
    idle: Mutex<Vec<TcpStream>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl SocketClientTransport {
    pub fn new(locator: &Locator, config: &Config) -> Self {
        Self {
            locator: locator.clone(),
            timeout: config.get_millis_or(keys::TIMEOUT, DEFAULT_TIMEOUT),
            idle: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        }
    }

    fn open(&self) -> Result<TcpStream> {
        let addr = resolve(&self.locator.connect_address())?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| Error::cannot_connect(&self.locator, e.to_string()))?;
        tune(&stream);
        if let Ok(local) = stream.local_addr() {
            *self.local_addr.lock() = Some(local);
        }
        log::trace!("[socket] connected to {}", addr);
        Ok(stream)
    }

    fn checkout(&self) -> Result<(TcpStream, bool)> {
        let idle = self.idle.lock().pop();
        match idle {
            Some(stream) => Ok((stream, true)),
            None => Ok((self.open()?, false)),
        }
    }

    fn checkin(&self, stream: TcpStream) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(stream);
        }
    }

    fn round_trip(
        &self,
        stream: &mut TcpStream,
        request: &InvocationRequest,
        timeout: Duration,
    ) -> Result<Option<InvocationResponse>> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        write_frame(stream, request)?;
        if request.is_oneway() {
            return Ok(None);
        }
        match read_frame(stream)? {
            Some(response) => Ok(Some(response)),
            None => Err(Error::Transport(format!(
                "{} closed the connection",
                self.locator
            ))),
        }
    }
}

impl ClientTransport for SocketClientTransport {
    fn connect(&self) -> Result<()> {
        let stream = self.open()?;
        self.checkin(stream);
        Ok(())
    }

    fn disconnect(&self) {
        for stream in self.idle.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        let timeout = request.timeout().unwrap_or(self.timeout);
        let (mut stream, pooled) = self.checkout()?;

        let result = match self.round_trip(&mut stream, &request, timeout) {
            // A pooled connection may have gone stale while idle.
            Err(e) if pooled && e.is_connectivity() && !matches!(e, Error::Timeout(_)) => {
                log::trace!("[socket] stale pooled connection: {}", e);
                stream = self.open()?;
                self.round_trip(&mut stream, &request, timeout)
            }
            other => other,
        };

        match result {
            Ok(Some(response)) => {
                self.checkin(stream);
                Ok(response)
            }
            Ok(None) => {
                self.checkin(stream);
                Ok(InvocationResponse::value(request.session_id, Value::Null))
            }
            Err(e) => {
                let _ = stream.shutdown(Shutdown::Both);
                Err(e)
            }
        }
    }

    fn local_address(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

// ============================================================================
// Server
// ============================================================================

/// Server side of the TCP transport.
pub struct SocketServerTransport {
    locator: Locator,
    shutdown: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    connections: Arc<Mutex<HashMap<u64, TcpStream>>>,
}

impl SocketServerTransport {
    pub fn new(locator: &Locator) -> Self {
        Self {
            locator: locator.clone(),
            shutdown: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn bind(&self) -> Result<TcpListener> {
        let home = match self.locator.homes().first() {
            Some(home) if self.locator.is_multihome() => home.clone(),
            _ => Home::new(self.locator.host(), self.locator.port()),
        };
        let addr = resolve(&home)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        Ok(listener)
    }
}

impl ServerTransport for SocketServerTransport {
    fn start(&self, invoker: Arc<ServerInvoker>) -> Result<Locator> {
        let listener = self.bind()?;
        let port = listener.local_addr()?.port();
        let resolved = if self.locator.port() == Some(port) {
            self.locator.clone()
        } else {
            self.locator.with_port(port)
        };

        let shutdown = Arc::clone(&self.shutdown);
        let connections = Arc::clone(&self.connections);
        let handle = thread::Builder::new()
            .name("remoting-socket-accept".into())
            .spawn(move || accept_loop(listener, invoker, shutdown, connections))
            .map_err(Error::Io)?;
        *self.accept_thread.lock() = Some(handle);

        log::info!("[socket] listening on {}", resolved);
        Ok(resolved)
    }

    fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        for (_, stream) in self.connections.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        log::debug!("[socket] {} stopped", self.locator);
    }
}

fn accept_loop(
    listener: TcpListener,
    invoker: Arc<ServerInvoker>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Mutex<HashMap<u64, TcpStream>>>,
) {
    let next_id = AtomicU64::new(0);
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    log::warn!("[socket] dropping {}: {}", peer, e);
                    continue;
                }
                tune(&stream);
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                if let Ok(clone) = stream.try_clone() {
                    connections.lock().insert(id, clone);
                }
                let invoker = Arc::clone(&invoker);
                let connections = Arc::clone(&connections);
                let spawned = thread::Builder::new()
                    .name("remoting-socket-conn".into())
                    .spawn(move || {
                        serve_connection(stream, peer, &invoker);
                        connections.lock().remove(&id);
                    });
                if let Err(e) = spawned {
                    log::error!("[socket] no thread for {}: {}", peer, e);
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::warn!("[socket] accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve_connection(mut stream: TcpStream, peer: SocketAddr, invoker: &ServerInvoker) {
    log::trace!("[socket] connection from {}", peer);
    loop {
        let mut request: InvocationRequest = match read_frame(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                log::debug!("[socket] {} read failed: {}", peer, e);
                break;
            }
        };
        request.peer_address = Some(peer);
        let oneway = request.is_oneway();
        let response = invoker.invoke(request);
        if oneway {
            continue;
        }
        if let Err(e) = write_frame(&mut stream, &response) {
            log::debug!("[socket] {} write failed: {}", peer, e);
            break;
        }
    }
    log::trace!("[socket] connection from {} closed", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::Command;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn frame_round_trip_and_eof() {
        let mut buf = Vec::new();
        let req = InvocationRequest::new("s-1", json!({"k": [1, 2]}));
        write_frame(&mut buf, &req).unwrap();
        assert_eq!(&buf[..4], &((buf.len() - 4) as u32).to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let back: InvocationRequest = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(back.session_id, "s-1");
        let eof: Option<InvocationRequest> = read_frame(&mut cursor).unwrap();
        assert!(eof.is_none());
    }

    #[test]
    fn oversized_and_empty_frames_rejected() {
        let mut cursor = Cursor::new(((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec());
        assert!(read_frame::<_, Value>(&mut cursor).is_err());
        let mut cursor = Cursor::new(0u32.to_be_bytes().to_vec());
        assert!(read_frame::<_, Value>(&mut cursor).is_err());
    }

    #[test]
    fn connect_refused_is_connectivity_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let loc = Locator::parse(&format!("socket://127.0.0.1:{}", port)).unwrap();
        let transport = SocketClientTransport::new(&loc, &Config::new());
        let err = transport.connect().unwrap_err();
        assert!(err.is_connectivity(), "{:?}", err);
    }

    #[test]
    fn echo_over_tcp() {
        let ctx = crate::RemotingContext::new();
        let loc = Locator::parse("socket://127.0.0.1:0").unwrap();
        let server = ctx
            .registry()
            .create_server_invoker(&loc, &Config::new())
            .unwrap();
        let resolved = server.start().unwrap();
        assert_ne!(resolved.port(), Some(0));

        let transport = SocketClientTransport::new(&resolved, &Config::new());
        transport.connect().unwrap();
        for _ in 0..3 {
            let resp = transport
                .invoke(InvocationRequest::new("s", Command::GetClientLocalAddress))
                .unwrap();
            assert_eq!(resp.into_result().unwrap(), json!("127.0.0.1"));
        }
        transport.disconnect();
        server.stop();
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Request/response round trips through the public facades.

use remoting::invocation::{Command, FaultKind, Metadata, Payload, CLIENT_MARKER_FRAME};
use remoting::{
    keys, Client, Config, Connector, Error, InvocationRequest, Locator, RemoteFault,
    RemotingContext, ServerInvocationHandler,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn handler<F>(f: F) -> Arc<dyn ServerInvocationHandler>
where
    F: Fn(&InvocationRequest) -> Result<Value, RemoteFault> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn echo() -> Arc<dyn ServerInvocationHandler> {
    handler(|req| match &req.payload {
        Payload::Data(v) => Ok(json!({ "echo": v })),
        _ => Err(RemoteFault::application("unexpected payload")),
    })
}

fn serve(
    ctx: &Arc<RemotingContext>,
    uri: &str,
    handlers: Vec<(&str, Arc<dyn ServerInvocationHandler>)>,
) -> (Connector, Locator) {
    let connector = Connector::new(Arc::clone(ctx), &Locator::parse(uri).unwrap(), Config::new());
    for (subsystem, h) in handlers {
        connector.add_invocation_handler(subsystem, h).unwrap();
    }
    let locator = connector.start().unwrap();
    (connector, locator)
}

#[test]
fn test_invoke_over_local_loopback() {
    let ctx = RemotingContext::new();
    let (_connector, locator) = serve(&ctx, "local://inv-echo:1", vec![("echo", echo())]);

    let client = Client::new(Arc::clone(&ctx), &locator, Config::new()).unwrap();
    client.connect().unwrap();
    assert!(client.is_connected());
    assert!(client.invoker().unwrap().is_loopback());
    assert_eq!(client.invoke(json!("hi"), None).unwrap(), json!({ "echo": "hi" }));

    client.disconnect();
    assert!(!client.is_connected());
    assert!(matches!(client.invoke(json!("hi"), None), Err(Error::NotConnected)));
}

#[test]
fn test_remote_fault_carries_server_then_client_frames() {
    let ctx = RemotingContext::new();
    let failing = handler(|_| Err(RemoteFault::application("boom")));
    let (_connector, locator) = serve(&ctx, "local://inv-fault:1", vec![("fail", failing)]);

    let client = Client::new(Arc::clone(&ctx), &locator, Config::new())
        .unwrap()
        .with_subsystem("fail");
    client.connect().unwrap();
    let Err(Error::RemoteApplication(fault)) = client.invoke(json!(1), None) else {
        panic!("expected a remote application fault");
    };
    assert_eq!(fault.kind, FaultKind::Application);
    assert_eq!(fault.message, "boom");
    assert_eq!(fault.subsystem.as_deref(), Some("fail"));

    let frames: Vec<&str> = fault.frames().collect();
    let server = frames
        .iter()
        .position(|f| f.starts_with("ServerInvoker["))
        .unwrap();
    let marker = frames.iter().position(|f| *f == CLIENT_MARKER_FRAME).unwrap();
    let local = frames.iter().position(|f| f.starts_with("Client[")).unwrap();
    assert!(server < marker && marker < local);
}

#[test]
fn test_subsystem_routing() {
    let ctx = RemotingContext::new();
    let a = handler(|_| Ok(json!("a")));
    let b = handler(|_| Ok(json!("b")));
    let (_connector, locator) = serve(&ctx, "local://inv-route:1", vec![("a", a), ("b", b)]);

    let to_b = Client::new(Arc::clone(&ctx), &locator, Config::new())
        .unwrap()
        .with_subsystem("b");
    to_b.connect().unwrap();
    assert_eq!(to_b.invoke(json!(null), None).unwrap(), json!("b"));

    let unnamed = Client::new(Arc::clone(&ctx), &locator, Config::new()).unwrap();
    unnamed.connect().unwrap();
    assert!(matches!(unnamed.invoke(json!(null), None), Err(Error::NoHandler(_))));
}

#[test]
fn test_reserved_commands() {
    let ctx = RemotingContext::new();
    let (_connector, locator) = serve(&ctx, "local://inv-cmd:1", vec![("echo", echo())]);
    let client = Client::new(Arc::clone(&ctx), &locator, Config::new()).unwrap();
    client.connect().unwrap();

    let mut metadata = Metadata::new();
    metadata.insert("color".into(), "blue".into());
    let echoed = client.invoke(Command::Echo, Some(metadata)).unwrap();
    assert_eq!(echoed["color"], json!("blue"));

    // Plain string form never reaches the handler.
    let echoed = client.invoke(json!("$ECHO$"), None).unwrap();
    assert!(echoed.is_object());

    let address = client.client_local_address().unwrap();
    assert!(address.is_some_and(|ip| ip.is_loopback()));
}

#[test]
fn test_oneway_server_side_and_client_side() {
    let ctx = RemotingContext::new();
    let (tx, rx) = mpsc::channel::<(Value, String)>();
    let tx = Mutex::new(tx);
    let recorder = handler(move |req| {
        let name = std::thread::current().name().unwrap_or("").to_string();
        if let Payload::Data(v) = &req.payload {
            let _ = tx.lock().unwrap().send((v.clone(), name));
        }
        Ok(json!("ignored"))
    });
    let (_connector, locator) = serve(&ctx, "local://inv-oneway:1", vec![("rec", recorder)]);
    let client = Client::new(Arc::clone(&ctx), &locator, Config::new()).unwrap();
    client.connect().unwrap();

    client.invoke_oneway(json!("server"), None, false).unwrap();
    let (v, thread) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(v, json!("server"));
    assert!(thread.starts_with("remoting-server-oneway"));

    client.invoke_oneway(json!("client"), None, true).unwrap();
    let (v, thread) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(v, json!("client"));
    assert!(thread.starts_with("remoting-client-oneway"));
}

#[test]
fn test_oneway_faults_are_not_reported() {
    let ctx = RemotingContext::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let failing = handler(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Err(RemoteFault::application("ignored"))
    });
    let (_connector, locator) = serve(&ctx, "local://inv-oneway-fault:1", vec![("f", failing)]);
    let client = Client::new(Arc::clone(&ctx), &locator, Config::new()).unwrap();
    client.connect().unwrap();

    client.invoke_oneway(json!(1), None, false).unwrap();
    client.invoke_oneway(json!(2), None, true).unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while calls.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_socket_transport_end_to_end() {
    let ctx = RemotingContext::new();
    let failing = handler(|_| Err(RemoteFault::application("over the wire")));
    let (_connector, locator) = serve(
        &ctx,
        "socket://127.0.0.1:0",
        vec![("echo", echo()), ("fail", failing)],
    );
    assert_ne!(locator.port(), Some(0));

    let remote = Config::new().with(keys::FORCE_REMOTE, true);
    let client = Client::new(Arc::clone(&ctx), &locator, remote.clone())
        .unwrap()
        .with_subsystem("echo");
    client.connect().unwrap();
    assert!(!client.invoker().unwrap().is_loopback());
    assert_eq!(
        client.invoke(json!([1, 2]), None).unwrap(),
        json!({ "echo": [1, 2] })
    );
    let address = client.client_local_address().unwrap();
    assert!(address.is_some_and(|ip| ip.is_loopback()));

    let failing = Client::new(Arc::clone(&ctx), &locator, remote)
        .unwrap()
        .with_subsystem("fail");
    failing.connect().unwrap();
    match failing.invoke(json!(null), None) {
        Err(Error::RemoteApplication(fault)) => {
            assert_eq!(fault.message, "over the wire");
            assert!(fault.frames().any(|f| f == CLIENT_MARKER_FRAME));
        }
        other => panic!("expected remote fault, got {:?}", other),
    }
}

#[test]
fn test_requests_carry_origin_locator_when_reachable() {
    let ctx = RemotingContext::new();
    let (tx, rx) = mpsc::channel::<Option<Locator>>();
    let tx = Mutex::new(tx);
    let origin = handler(move |req| {
        let _ = tx.lock().unwrap().send(req.origin_locator.clone());
        Ok(Value::Null)
    });
    let (_local, local_locator) = serve(&ctx, "local://inv-origin:1", vec![("o", Arc::clone(&origin))]);
    let (_socket, socket_locator) = serve(&ctx, "socket://127.0.0.1:0", vec![("o", origin)]);

    let loopback = Client::new(Arc::clone(&ctx), &local_locator, Config::new()).unwrap();
    loopback.connect().unwrap();
    loopback.invoke(json!(1), None).unwrap();
    let seen = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(seen.is_some());
    assert_eq!(seen, loopback.invoker().unwrap().callback_locator());

    let remote = Client::new(
        Arc::clone(&ctx),
        &socket_locator,
        Config::new().with(keys::FORCE_REMOTE, true),
    )
    .unwrap();
    remote.connect().unwrap();
    remote.invoke(json!(2), None).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), None);
}

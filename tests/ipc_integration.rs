//! Integration tests for client ↔ server communication.
//!
//! These tests run the full IPC stack over real Unix domain and TCP sockets: a
//! [`Connection`] driven on the test thread against either the in-process
//! [`Server`] (on its own multi-threaded runtime) or a scripted peer thread.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=xmmsv_ipc=debug cargo test --test ipc_integration -- --nocapture
//! ```

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use xmmsv_ipc::ipc::server::{CommandHandler, Server, ServerHandle};
use xmmsv_ipc::ipc::{mainloop, Message, MessageReader, CMD_REPLY, DEFAULT_MAX_PAYLOAD};
use xmmsv_ipc::{ClientConfig, Connection, IpcError, Value};

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const PLAYBACK: u32 = 3;
const CMD_ECHO: u32 = 10;
const CMD_SUM: u32 = 11;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn playback_handler(_: &ServerHandle, object_id: u32, command_id: u32, args: Value) -> Value {
    match (object_id, command_id) {
        (PLAYBACK, CMD_ECHO) => args,
        (PLAYBACK, CMD_SUM) => match args.list_items() {
            Some(items) => Value::new_int(items.iter().filter_map(Value::get_int).sum()),
            None => Value::new_error("expected a list of ints"),
        },
        _ => Value::new_error("no such command"),
    }
}

/// An in-process server on a private socket.
struct Fixture {
    handle: ServerHandle,
    config: ClientConfig,
    // Dropped last: shutting down the runtime stops the server tasks.
    _runtime: Runtime,
    _dir: TempDir,
}

impl Fixture {
    fn start(max_payload: u32) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("xmms-ipc.sock");
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("Failed to build runtime");

        let handler: Arc<dyn CommandHandler> = Arc::new(playback_handler);
        let server = {
            let _guard = runtime.enter();
            Server::bind(&path, handler)
                .expect("Server should bind")
                .with_max_payload(max_payload)
        };
        let handle = server.handle();
        runtime.spawn(server.run());

        Self {
            handle,
            config: ClientConfig {
                path: Some(format!("unix://{}", path.display())),
                ..ClientConfig::default()
            },
            _runtime: runtime,
            _dir: dir,
        }
    }

    fn connect(&self) -> Connection {
        Connection::connect_with(&self.config).expect("Should connect to server")
    }
}

/// Poll `check` until it holds or the test timeout passes.
fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !check() {
        assert!(Instant::now() < deadline, "Timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Drive `conn` until `done` holds.
fn pump_until(conn: &Connection, what: &str, done: impl Fn() -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !done() {
        assert!(Instant::now() < deadline, "Timed out waiting for {}", what);
        conn.wait_io(Some(Duration::from_millis(50))).expect("Connection failed");
    }
}

#[test]
fn test_command_roundtrip_through_server() {
    let fixture = Fixture::start(DEFAULT_MAX_PAYLOAD);
    let conn = fixture.connect();

    let args = Value::build_list([Value::new_int(2), Value::new_int(40)]);
    let sum = conn.send_command(PLAYBACK, CMD_SUM, &args).unwrap();
    let echo = conn
        .send_command(PLAYBACK, CMD_ECHO, &Value::build_dict([("volume", Value::new_int(70))]))
        .unwrap();

    assert_eq!(sum.wait().unwrap().get_int(), Some(42));
    assert_eq!(echo.wait().unwrap().dict_get_int("volume"), Some(70));
    assert_eq!(conn.pending_count(), 0);
}

#[test]
fn test_server_error_is_delivered_as_error_state() {
    let fixture = Fixture::start(DEFAULT_MAX_PAYLOAD);
    let conn = fixture.connect();

    let result = conn.send_command(PLAYBACK, 99, &Value::new_none()).unwrap();
    match result.wait() {
        Err(IpcError::Server(message)) => assert_eq!(message, "no such command"),
        other => panic!("Expected a server error, got {:?}", other),
    }
    assert!(result.is_error());
    assert!(conn.is_connected(), "an error reply must not close the connection");
}

#[test]
fn test_replies_in_scrambled_order_reach_their_requests() {
    init_tracing();
    let (ours, mut theirs) = UnixStream::pair().expect("Failed to create socket pair");
    let conn = Connection::from_unix_stream(ours, DEFAULT_MAX_PAYLOAD).unwrap();

    let results: Vec<_> = (0..100)
        .map(|i| conn.send_command(PLAYBACK, CMD_ECHO, &Value::new_int(i)).unwrap())
        .collect();

    let peer = thread::spawn(move || {
        let mut reader = MessageReader::new(DEFAULT_MAX_PAYLOAD);
        let mut requests = Vec::new();
        let mut buf = [0u8; 4096];
        while requests.len() < 100 {
            let n = theirs.read(&mut buf).expect("peer read");
            assert!(n > 0, "client hung up early");
            requests.extend(reader.feed(&buf[..n]).expect("valid framing"));
        }
        for i in 0..100 {
            let request = &requests[(i * 37) % 100];
            let doubled = Value::new_int(request.value().unwrap().get_int().unwrap() * 2);
            let reply = Message::with_value(PLAYBACK, CMD_REPLY, request.cookie, &doubled).unwrap();
            theirs.write_all(&reply.to_bytes(DEFAULT_MAX_PAYLOAD).unwrap()).unwrap();
        }
        theirs
    });

    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.wait().unwrap().get_int(), Some(i as i64 * 2), "result {}", i);
    }
    assert!(results.iter().all(|r| r.deliveries() == 1));
    assert_eq!(conn.pending_count(), 0);

    let _peer = peer.join().expect("peer panicked");
}

#[test]
fn test_command_roundtrip_over_tcp() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let port = listener.local_addr().unwrap().port();

    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut reader = MessageReader::new(DEFAULT_MAX_PAYLOAD);
        let mut buf = [0u8; 4096];
        let request = loop {
            let n = stream.read(&mut buf).expect("peer read");
            assert!(n > 0, "client hung up early");
            if let Some(request) = reader.feed(&buf[..n]).expect("valid framing").pop() {
                break request;
            }
        };
        let args = request.value().expect("decodable args");
        let reply = Message::with_value(request.object_id, CMD_REPLY, request.cookie, &args).unwrap();
        stream.write_all(&reply.to_bytes(DEFAULT_MAX_PAYLOAD).unwrap()).unwrap();
        stream
    });

    let conn = Connection::connect(&format!("tcp://127.0.0.1:{port}")).expect("Failed to connect over TCP");
    let args = Value::build_list([Value::new_string("over tcp"), Value::new_int(5555)]);
    let reply = conn.send_command(PLAYBACK, CMD_ECHO, &args).unwrap().wait().unwrap();

    assert_eq!(reply, args);
    assert!(conn.is_connected());
    let _peer = peer.join().expect("peer panicked");
}

#[test]
fn test_broadcast_fans_out_to_every_subscriber() {
    let fixture = Fixture::start(DEFAULT_MAX_PAYLOAD);
    let first = fixture.connect();
    let second = fixture.connect();

    // Two subscriptions on one connection share a single server registration.
    let a = first.subscribe_broadcast(7).unwrap();
    let b = first.subscribe_broadcast(7).unwrap();
    let c = second.subscribe_broadcast(7).unwrap();
    let unrelated = second.subscribe_broadcast(8).unwrap();
    assert_eq!(first.subscriber_count(7), 2);

    wait_until("subscriptions", || fixture.handle.subscriber_count(7) == 2);
    let mut channel = c.channel();

    for volume in [10, 20, 30] {
        assert_eq!(fixture.handle.broadcast(7, &Value::new_int(volume)).unwrap(), 2);
    }

    pump_until(&first, "first connection", || a.deliveries() == 3 && b.deliveries() == 3);
    pump_until(&second, "second connection", || c.deliveries() == 3);

    assert_eq!(a.value().and_then(|v| v.get_int()), Some(30));
    assert_eq!(b.value().and_then(|v| v.get_int()), Some(30));
    let mut received = Vec::new();
    while let Ok(value) = channel.try_recv() {
        received.extend(value.get_int());
    }
    assert_eq!(received, vec![10, 20, 30]);
    assert_eq!(unrelated.deliveries(), 0);
    assert!(!a.is_pending() && !a.is_error());
}

#[test]
fn test_signal_result_restarts_itself() {
    let fixture = Fixture::start(DEFAULT_MAX_PAYLOAD);
    let conn = fixture.connect();

    let signal = conn.request_signal(11).unwrap();
    let first_cookie = signal.cookie();
    wait_until("signal request", || fixture.handle.waiter_count(11) == 1);

    fixture.handle.emit_signal(11, &Value::new_int(1)).unwrap();
    assert_eq!(signal.wait().unwrap().get_int(), Some(1));
    assert_ne!(signal.cookie(), first_cookie);

    // The re-request reached the server before the notifier ran.
    wait_until("re-request", || fixture.handle.waiter_count(11) == 1);
    fixture.handle.emit_signal(11, &Value::new_int(2)).unwrap();
    assert_eq!(signal.wait().unwrap().get_int(), Some(2));

    signal.set_auto_restart(false);
    wait_until("last re-request", || fixture.handle.waiter_count(11) == 1);
    fixture.handle.emit_signal(11, &Value::new_int(3)).unwrap();
    assert_eq!(signal.wait().unwrap().get_int(), Some(3));
    assert_eq!(conn.pending_count(), 0);
    assert_eq!(signal.deliveries(), 3);
}

#[test]
fn test_server_hangup_fails_outstanding_results() {
    // The server refuses anything over 1 KiB and drops the client.
    let fixture = Fixture::start(1024);
    let conn = fixture.connect();

    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    conn.set_disconnect_callback(move || counter.set(counter.get() + 1));

    let subscription = conn.subscribe_broadcast(5).unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    subscription.set_notifier(move |v| sink.borrow_mut().push(v.clone()));
    wait_until("subscription", || fixture.handle.subscriber_count(5) == 1);

    let oversized = conn
        .send_command(PLAYBACK, CMD_ECHO, &Value::new_binary(vec![7u8; 4096]))
        .unwrap();
    let bystander = conn.send_command(PLAYBACK, CMD_ECHO, &Value::new_none()).unwrap();

    assert!(matches!(oversized.wait(), Err(IpcError::Disconnected)));
    assert!(bystander.is_error());
    assert!(subscription.is_error());
    assert_eq!(seen.borrow().len(), 1);
    assert!(seen.borrow()[0].is_error());
    assert!(!conn.is_connected());

    conn.disconnect();
    assert_eq!(calls.get(), 1);
    wait_until("server cleanup", || fixture.handle.client_count() == 0);
}

#[test]
fn test_dropped_result_ignores_late_reply() {
    let fixture = Fixture::start(DEFAULT_MAX_PAYLOAD);
    let conn = fixture.connect();

    let notified = Rc::new(Cell::new(false));
    let flag = Rc::clone(&notified);
    let abandoned = conn.send_command(PLAYBACK, CMD_ECHO, &Value::new_int(1)).unwrap();
    abandoned.set_notifier(move |_| flag.set(true));
    drop(abandoned);

    let kept = conn.send_command(PLAYBACK, CMD_ECHO, &Value::new_int(2)).unwrap();
    assert_eq!(kept.wait().unwrap().get_int(), Some(2));
    assert!(!notified.get());
}

#[test]
fn test_mainloop_drives_connection() {
    let fixture = Fixture::start(DEFAULT_MAX_PAYLOAD);
    let conn = fixture.connect();

    let status = conn.subscribe_broadcast(1).unwrap();
    let sum = conn
        .send_command(PLAYBACK, CMD_SUM, &Value::build_list([Value::new_int(5), Value::new_int(6)]))
        .unwrap();
    wait_until("subscription", || fixture.handle.subscriber_count(1) == 1);
    for state in [1, 2, 0] {
        fixture.handle.broadcast(1, &Value::new_int(state)).unwrap();
    }

    let local = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");
    local.block_on(async {
        let settled = async {
            while status.deliveries() < 3 || sum.is_pending() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        let outcome = tokio::time::timeout(TEST_TIMEOUT, async {
            tokio::select! {
                ended = mainloop::run(&conn) => panic!("Main loop ended early: {:?}", ended),
                _ = settled => {}
            }
        })
        .await;
        outcome.expect("Test timed out");
    });

    assert_eq!(status.value().and_then(|v| v.get_int()), Some(0));
    assert_eq!(sum.value().and_then(|v| v.get_int()), Some(11));
}

#[test]
fn test_connect_to_missing_server_fails() {
    let dir = tempfile::tempdir().unwrap();
    let address = format!("unix://{}", dir.path().join("nobody-home").display());
    match Connection::connect(&address) {
        Err(IpcError::ConnectionFailed(_)) => {}
        Err(other) => panic!("Expected ConnectionFailed, got {:?}", other),
        Ok(_) => panic!("Connected to a socket that does not exist"),
    }
}

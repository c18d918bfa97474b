//! IPC client engine.
//!
//! This module provides [`Connection`], which multiplexes commands, signal
//! requests and broadcast subscriptions over one socket and routes every
//! incoming message to the [`CommandResult`] waiting for it.
//!
//! # Routing
//!
//! 1. A cookie at or below [`BROADCAST_COOKIE`] whose command id has
//!    subscribers fans out to every subscriber.
//! 2. Otherwise the cookie is looked up among outstanding requests. The entry
//!    is removed; an auto-restarting signal result is re-requested under a
//!    fresh cookie before its notifiers run.
//! 3. Anything else is dropped.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::address::{Address, AddressError};
use super::framing::{FramingError, MessageReader};
use super::message::Message;
use super::result::{CommandResult, Failure, ResultInner, ResultKind};
use super::transport::{Disconnect, Transport};
use super::{BROADCAST_COOKIE, CMD_BROADCAST, CMD_ERROR, CMD_SIGNAL, SIGNAL_OBJECT};
use crate::config::ClientConfig;
use crate::serialize::{serialize_to_bytes, CodecError};
use crate::Value;

/// IPC-specific error types.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to connect to the server socket.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] io::Error),

    #[error(transparent)]
    Address(#[from] AddressError),

    /// The connection is closed.
    #[error("Disconnected from server")]
    Disconnected,

    /// The server answered with an error value.
    #[error("Server error: {0}")]
    Server(String),

    /// Malformed data from the server.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request arguments could not be encoded.
    #[error("Encoding failed: {0}")]
    Codec(#[from] CodecError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// `restart` on a plain command result.
    #[error("Result cannot be restarted")]
    NotRestartable,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for IpcError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => IpcError::ConnectionFailed(err),
            _ => IpcError::Io(err),
        }
    }
}

/// A table slot. The weak reference lets a dropped handle vanish; a
/// detached handle is kept alive by `keep_alive` instead.
struct Entry {
    result: Weak<ResultInner>,
    keep_alive: Option<Rc<ResultInner>>,
}

impl Entry {
    fn new(result: &Rc<ResultInner>) -> Self {
        Self {
            result: Rc::downgrade(result),
            keep_alive: None,
        }
    }

    fn upgrade(&self) -> Option<Rc<ResultInner>> {
        self.result.upgrade()
    }

    fn is(&self, result: &ResultInner) -> bool {
        std::ptr::eq(self.result.as_ptr(), result)
    }
}

enum Route {
    Fanout(Vec<Rc<ResultInner>>, Value),
    Reply(Rc<ResultInner>, Result<Value, Failure>),
    Dropped,
}

pub(crate) struct Engine {
    transport: Transport,
    reader: MessageReader,
    max_payload: u32,
    next_cookie: i32,
    pending: HashMap<i32, Entry>,
    broadcasts: HashMap<u32, Vec<Entry>>,
    on_disconnect: Option<Box<dyn FnMut()>>,
    /// Last `want_out` state reported to `on_need_out` and `out_queued`.
    want_out_seen: bool,
    on_need_out: Option<Box<dyn FnMut(bool)>>,
    /// Signalled when the send queue becomes non-empty.
    out_queued: Rc<Notify>,
}

impl Engine {
    fn new(transport: Transport, max_payload: u32) -> Self {
        Self {
            transport,
            reader: MessageReader::new(max_payload),
            max_payload,
            next_cookie: 1,
            pending: HashMap::new(),
            broadcasts: HashMap::new(),
            on_disconnect: None,
            want_out_seen: false,
            on_need_out: None,
            out_queued: Rc::new(Notify::new()),
        }
    }

    /// Next free cookie: positive, wrapping back to 1 past `i32::MAX`, never
    /// one still outstanding.
    fn alloc_cookie(&mut self) -> i32 {
        loop {
            let cookie = self.next_cookie;
            self.next_cookie = if cookie == i32::MAX { 1 } else { cookie + 1 };
            if !self.pending.contains_key(&cookie) {
                return cookie;
            }
        }
    }

    /// Queue a message and try to flush right away.
    fn enqueue(&mut self, message: &Message) -> Result<Option<Disconnect>, FramingError> {
        let bytes = message.to_bytes(self.max_payload)?;
        self.transport.enqueue(bytes);
        Ok(self.transport.handle_writable())
    }

    /// Drop the table slot of `result`.
    ///
    /// The wire protocol has no way to cancel a broadcast subscription, so
    /// the server keeps sending firings for a forgotten one; `route` drops
    /// them once no live subscriber is left.
    pub(crate) fn forget(&mut self, result: &ResultInner) {
        match result.kind() {
            ResultKind::Broadcast(id) => {
                if let Some(entries) = self.broadcasts.get_mut(&id) {
                    entries.retain(|e| !e.is(result));
                    if entries.is_empty() {
                        self.broadcasts.remove(&id);
                    }
                }
            }
            ResultKind::Command | ResultKind::Signal(_) => {
                let cookie = result.cookie();
                if self.pending.get(&cookie).is_some_and(|e| e.is(result)) {
                    self.pending.remove(&cookie);
                }
            }
        }
    }

    pub(crate) fn keep_alive(&mut self, result: &Rc<ResultInner>) {
        let entry = match result.kind() {
            ResultKind::Broadcast(id) => self
                .broadcasts
                .get_mut(&id)
                .and_then(|entries| entries.iter_mut().find(|e| e.is(result))),
            ResultKind::Command | ResultKind::Signal(_) => self
                .pending
                .get_mut(&result.cookie())
                .filter(|e| e.is(result)),
        };
        if let Some(entry) = entry {
            entry.keep_alive = Some(Rc::clone(result));
        }
    }

    /// Send the signal request for `result` again under a fresh cookie.
    fn reissue_signal(&mut self, result: &Rc<ResultInner>, entry: Entry) -> Option<Disconnect> {
        let ResultKind::Signal(id) = result.kind() else {
            return None;
        };
        let cookie = self.alloc_cookie();
        result.set_cookie(cookie);
        result.set_in_flight(true);
        self.pending.insert(cookie, entry);
        debug!("Re-requesting signal {} with cookie {}", id, cookie);

        let message = match Message::with_value(SIGNAL_OBJECT, CMD_SIGNAL, cookie, &Value::from(id)) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to encode signal request: {}", e);
                return None;
            }
        };
        match self.enqueue(&message) {
            Ok(disconnect) => disconnect,
            Err(e) => {
                error!("Failed to queue signal request: {}", e);
                None
            }
        }
    }

    fn route(&mut self, message: &Message, decoded: Result<Value, CodecError>) -> (Route, Option<Disconnect>) {
        if message.cookie <= BROADCAST_COOKIE {
            let Some(entries) = self.broadcasts.get_mut(&message.command_id) else {
                debug!("Dropping broadcast {} with no subscribers", message.command_id);
                return (Route::Dropped, None);
            };
            entries.retain(|e| e.upgrade().is_some());
            let targets = entries.iter().filter_map(Entry::upgrade).collect();
            return match decoded {
                Ok(value) => (Route::Fanout(targets, value), None),
                Err(e) => {
                    warn!("Discarding undecodable broadcast {}: {}", message.command_id, e);
                    (Route::Dropped, None)
                }
            };
        }

        let Some(entry) = self.pending.remove(&message.cookie) else {
            debug!("Dropping reply for unknown cookie {}", message.cookie);
            return (Route::Dropped, None);
        };
        let Some(result) = entry.upgrade() else {
            debug!("Dropping reply for cancelled cookie {}", message.cookie);
            return (Route::Dropped, None);
        };
        result.set_in_flight(false);

        let outcome = match decoded {
            Err(e) => Err(Failure::Malformed(e.to_string())),
            Ok(value) if message.command_id == CMD_ERROR || value.is_error() => {
                Err(Failure::Server(error_message(&value)))
            }
            Ok(value) => Ok(value),
        };

        let disconnect = if outcome.is_ok() && result.auto_restarts() {
            self.reissue_signal(&result, entry)
        } else {
            None
        };
        (Route::Reply(result, outcome), disconnect)
    }

    /// Empty both tables, returning every live result.
    fn drain(&mut self) -> Vec<Rc<ResultInner>> {
        let pending = self.pending.drain().map(|(_, e)| e);
        let broadcasts = self.broadcasts.drain().flat_map(|(_, entries)| entries);
        pending.chain(broadcasts).filter_map(|e| e.upgrade()).collect()
    }
}

fn error_message(value: &Value) -> String {
    value
        .get_error()
        .or_else(|| value.get_string())
        .unwrap_or_else(|| "unknown server error".to_string())
}

/// Fail everything still outstanding and run the disconnect callback.
fn handle_disconnect(engine: &Rc<RefCell<Engine>>, reason: Disconnect) {
    let (results, callback) = {
        let mut e = engine.borrow_mut();
        (e.drain(), e.on_disconnect.take())
    };
    info!("Connection closed ({:?}); failing {} results", reason, results.len());
    for result in results {
        result.fail(Failure::Disconnected);
    }
    if let Some(mut callback) = callback {
        callback();
    }
}

/// Report a change of `want_out` to the need-out callback and wake a main
/// loop parked on readability.
fn sync_want_out(engine: &Rc<RefCell<Engine>>) {
    let (callback, want) = {
        let mut e = engine.borrow_mut();
        let want = e.transport.want_out();
        if want == e.want_out_seen {
            return;
        }
        e.want_out_seen = want;
        if want {
            e.out_queued.notify_one();
        }
        (e.on_need_out.take(), want)
    };
    if let Some(mut callback) = callback {
        callback(want);
        // The callback may have installed a replacement.
        let mut e = engine.borrow_mut();
        if e.on_need_out.is_none() {
            e.on_need_out = Some(callback);
        }
    }
}

fn dispatch(engine: &Rc<RefCell<Engine>>, message: Message) {
    let decoded = message.value();
    let (route, disconnect) = engine.borrow_mut().route(&message, decoded);
    match route {
        Route::Fanout(targets, value) => {
            for target in targets {
                target.deliver(&value);
            }
        }
        Route::Reply(result, Ok(value)) => result.deliver(&value),
        Route::Reply(result, Err(failure)) => result.fail(failure),
        Route::Dropped => {}
    }
    if let Some(reason) = disconnect {
        handle_disconnect(engine, reason);
    }
}

pub(crate) fn in_handle(engine: &Rc<RefCell<Engine>>) -> bool {
    let (messages, failure, disconnect) = {
        let mut e = engine.borrow_mut();
        let disconnect = e.transport.handle_readable();
        let data = e.transport.take_received();
        match e.reader.feed(&data) {
            Ok(messages) => (messages, e.reader.failure().cloned(), disconnect),
            Err(err) => (Vec::new(), Some(err), disconnect),
        }
    };

    // Messages that arrived intact go out before any close is handled.
    for message in messages {
        dispatch(engine, message);
    }
    let disconnect = match failure {
        Some(err) => {
            let aborted = engine.borrow_mut().transport.abort(err.to_string());
            if aborted.is_some() {
                error!("Closing connection: {}", err);
            }
            aborted.or(disconnect)
        }
        None => disconnect,
    };
    if let Some(reason) = disconnect {
        handle_disconnect(engine, reason);
    }
    sync_want_out(engine);
    engine.borrow().transport.is_connected()
}

pub(crate) fn out_handle(engine: &Rc<RefCell<Engine>>) -> bool {
    let disconnect = engine.borrow_mut().transport.handle_writable();
    if let Some(reason) = disconnect {
        handle_disconnect(engine, reason);
    }
    sync_want_out(engine);
    engine.borrow().transport.is_connected()
}

/// One blocking round: wait for readiness, then flush and read.
pub(crate) fn drive(engine: &Rc<RefCell<Engine>>, timeout: Option<Duration>) -> Result<(), IpcError> {
    let ready = {
        let e = engine.borrow();
        if !e.transport.is_connected() {
            return Err(IpcError::Disconnected);
        }
        e.transport.poll(timeout)?
    };
    if ready.writable {
        out_handle(engine);
    }
    if ready.readable {
        in_handle(engine);
    }
    Ok(())
}

pub(crate) fn restart_signal(engine: &Rc<RefCell<Engine>>, result: &Rc<ResultInner>) -> Result<(), IpcError> {
    let disconnect = {
        let mut e = engine.borrow_mut();
        if !e.transport.is_connected() {
            return Err(IpcError::Disconnected);
        }
        let entry = match e.pending.remove(&result.cookie()) {
            Some(entry) if entry.is(result) => entry,
            Some(other) => {
                e.pending.insert(result.cookie(), other);
                Entry::new(result)
            }
            None => Entry::new(result),
        };
        result.reset();
        e.reissue_signal(result, entry)
    };
    if let Some(reason) = disconnect {
        handle_disconnect(engine, reason);
    }
    sync_want_out(engine);
    Ok(())
}

/// A client connection to the daemon.
///
/// The connection is single-threaded: it can be driven synchronously through
/// [`CommandResult::wait`] and [`Connection::wait_io`], or from a host event
/// loop that watches [`Connection::io_fd`] and calls
/// [`Connection::io_in_handle`] / [`Connection::io_out_handle`].
///
/// # Example
///
/// ```ignore
/// use xmmsv_ipc::{Connection, Value};
///
/// let conn = Connection::connect("tcp://localhost:5555")?;
/// conn.set_disconnect_callback(|| eprintln!("server went away"));
///
/// let playing = conn.subscribe_broadcast(7)?;
/// playing.set_notifier(|v| println!("now playing {:?}", v));
/// playing.detach();
///
/// let reply = conn.send_command(2, 1, &Value::new_none())?.wait()?;
/// ```
pub struct Connection {
    inner: Rc<RefCell<Engine>>,
}

impl Connection {
    /// Connect to `address` (`unix:///path`, `tcp://host:port` or a bare
    /// absolute path).
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Address` for an unparsable address and
    /// `IpcError::ConnectionFailed` if:
    /// - The socket file does not exist
    /// - Connection is refused (server not running)
    pub fn connect(address: &str) -> Result<Self, IpcError> {
        Self::connect_with(&ClientConfig {
            path: Some(address.to_string()),
            ..ClientConfig::default()
        })
    }

    /// Connect using `config`, resolving the default address if it names none.
    pub fn connect_with(config: &ClientConfig) -> Result<Self, IpcError> {
        let address: Address = config.address().parse()?;
        let transport = Transport::connect(&address)?;
        info!("{} connected to {}", config.client_name, address);
        Ok(Self::from_transport(transport, config.max_payload_len))
    }

    /// Use an already connected Unix socket, e.g. one end of a socket pair.
    pub fn from_unix_stream(stream: UnixStream, max_payload: u32) -> Result<Self, IpcError> {
        Ok(Self::from_transport(Transport::from_unix(stream)?, max_payload))
    }

    pub fn from_transport(transport: Transport, max_payload: u32) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Engine::new(transport, max_payload))),
        }
    }

    fn submit(&self, kind: ResultKind, object_id: u32, command_id: u32, args: &Value) -> Result<CommandResult, IpcError> {
        let payload = serialize_to_bytes(args)?;
        let (result, disconnect) = {
            let mut e = self.inner.borrow_mut();
            if !e.transport.is_connected() {
                return Err(IpcError::Disconnected);
            }
            let cookie = match kind {
                ResultKind::Broadcast(_) => BROADCAST_COOKIE,
                ResultKind::Command | ResultKind::Signal(_) => e.alloc_cookie(),
            };
            let message = Message::new(object_id, command_id, cookie, payload);
            let bytes = message.to_bytes(e.max_payload)?;

            let result = Rc::new(ResultInner::new(Rc::downgrade(&self.inner), kind, cookie));
            match kind {
                ResultKind::Broadcast(id) => e.broadcasts.entry(id).or_default().push(Entry::new(&result)),
                ResultKind::Command | ResultKind::Signal(_) => {
                    e.pending.insert(cookie, Entry::new(&result));
                }
            }
            e.transport.enqueue(bytes);
            (result, e.transport.handle_writable())
        };
        if let Some(reason) = disconnect {
            handle_disconnect(&self.inner, reason);
        }
        sync_want_out(&self.inner);
        Ok(CommandResult::new(result))
    }

    /// Send a command; the result completes with the server's reply.
    ///
    /// # Errors
    ///
    /// - `IpcError::Codec` if `args` cannot be serialized
    /// - `IpcError::Framing` if the payload exceeds the configured ceiling
    /// - `IpcError::Disconnected` if the connection is closed
    pub fn send_command(&self, object_id: u32, command_id: u32, args: &Value) -> Result<CommandResult, IpcError> {
        self.submit(ResultKind::Command, object_id, command_id, args)
    }

    /// Subscribe to broadcast `signal_id`. Every firing is delivered to the
    /// returned result until it is dropped.
    pub fn subscribe_broadcast(&self, signal_id: u32) -> Result<CommandResult, IpcError> {
        self.submit(
            ResultKind::Broadcast(signal_id),
            SIGNAL_OBJECT,
            CMD_BROADCAST,
            &Value::from(signal_id),
        )
    }

    /// Request the next emission of signal `signal_id`. The result re-requests
    /// itself after each emission unless auto-restart is turned off.
    pub fn request_signal(&self, signal_id: u32) -> Result<CommandResult, IpcError> {
        self.submit(
            ResultKind::Signal(signal_id),
            SIGNAL_OBJECT,
            CMD_SIGNAL,
            &Value::from(signal_id),
        )
    }

    /// Socket descriptor to watch for readability (and writability while
    /// [`Connection::io_want_out`] holds).
    pub fn io_fd(&self) -> RawFd {
        self.inner.borrow().transport.fd()
    }

    pub fn io_want_out(&self) -> bool {
        self.inner.borrow().transport.want_out()
    }

    /// Call `callback` with the new value whenever [`Connection::io_want_out`]
    /// changes: `true` once bytes are left queued, `false` once they are
    /// flushed or dropped by a disconnect.
    ///
    /// Host event loops use this to add and remove their writability watch.
    pub fn set_need_out_callback<F>(&self, callback: F)
    where
        F: FnMut(bool) + 'static,
    {
        self.inner.borrow_mut().on_need_out = Some(Box::new(callback));
    }

    /// Signalled each time the send queue goes from empty to non-empty.
    pub(crate) fn out_queued(&self) -> Rc<Notify> {
        Rc::clone(&self.inner.borrow().out_queued)
    }

    /// Read and dispatch what is available, up to one read budget. Returns
    /// whether the connection is still open.
    pub fn io_in_handle(&self) -> bool {
        in_handle(&self.inner)
    }

    /// Whether the last [`Connection::io_in_handle`] stopped at its read
    /// budget with input possibly left on the socket. Edge-triggered event
    /// loops must call it again before waiting.
    pub fn io_input_pending(&self) -> bool {
        self.inner.borrow().transport.input_pending()
    }

    /// Flush queued messages. Returns whether the connection is still open.
    pub fn io_out_handle(&self) -> bool {
        out_handle(&self.inner)
    }

    /// Block until the socket is ready (or `timeout` passes), then flush and
    /// dispatch.
    pub fn wait_io(&self, timeout: Option<Duration>) -> Result<(), IpcError> {
        drive(&self.inner, timeout)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().transport.is_connected()
    }

    /// Close the connection. Outstanding results fail with
    /// `IpcError::Disconnected` and the disconnect callback runs.
    pub fn disconnect(&self) {
        let disconnect = self.inner.borrow_mut().transport.disconnect();
        if let Some(reason) = disconnect {
            handle_disconnect(&self.inner, reason);
        }
        sync_want_out(&self.inner);
    }

    /// Run `callback` once when the connection closes, for whatever reason.
    pub fn set_disconnect_callback<F>(&self, callback: F)
    where
        F: FnMut() + 'static,
    {
        self.inner.borrow_mut().on_disconnect = Some(Box::new(callback));
    }

    /// Requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Live subscriptions to `signal_id`.
    pub fn subscriber_count(&self, signal_id: u32) -> usize {
        self.inner
            .borrow()
            .broadcasts
            .get(&signal_id)
            .map_or(0, |entries| entries.iter().filter(|e| e.upgrade().is_some()).count())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

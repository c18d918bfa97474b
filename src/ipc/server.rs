//! Minimal daemon side of the protocol.
//!
//! [`Server`] accepts clients on a Unix socket, answers requests through a
//! [`CommandHandler`], and keeps track of broadcast subscribers and signal
//! waiters so the daemon can push values with [`ServerHandle::broadcast`] and
//! [`ServerHandle::emit_signal`].
//!
//! Each client gets a reader task and a writer task joined by an unbounded
//! channel, so replies, broadcasts and signals never interleave mid-message.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::framing::{read_message, write_message};
use super::message::Message;
use super::{BROADCAST_COOKIE, CMD_BROADCAST, CMD_ERROR, CMD_REPLY, CMD_SIGNAL, DEFAULT_MAX_PAYLOAD, SIGNAL_OBJECT};
use crate::serialize::CodecError;
use crate::Value;

/// Answers one request. An error value is sent back as an error reply.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, server: &ServerHandle, object_id: u32, command_id: u32, args: Value) -> Value;
}

impl<F> CommandHandler for F
where
    F: Fn(&ServerHandle, u32, u32, Value) -> Value + Send + Sync,
{
    fn handle(&self, server: &ServerHandle, object_id: u32, command_id: u32, args: Value) -> Value {
        self(server, object_id, command_id, args)
    }
}

type ClientId = u64;

#[derive(Default)]
struct Registry {
    next_client: ClientId,
    clients: HashMap<ClientId, mpsc::UnboundedSender<Message>>,
    broadcasts: HashMap<u32, HashSet<ClientId>>,
    /// Signal id → (client, cookie) waiting for the next emission.
    waiters: HashMap<u32, Vec<(ClientId, i32)>>,
}

impl Registry {
    fn add_client(&mut self, tx: mpsc::UnboundedSender<Message>) -> ClientId {
        self.next_client += 1;
        self.clients.insert(self.next_client, tx);
        self.next_client
    }

    fn remove_client(&mut self, id: ClientId) {
        self.clients.remove(&id);
        self.broadcasts.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
        self.waiters.retain(|_, waiting| {
            waiting.retain(|(client, _)| *client != id);
            !waiting.is_empty()
        });
    }

    fn send(&self, client: ClientId, message: Message) -> bool {
        self.clients
            .get(&client)
            .is_some_and(|tx| tx.send(message).is_ok())
    }
}

/// Cheap handle for pushing values to connected clients.
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<Mutex<Registry>>,
}

impl ServerHandle {
    /// Send `value` to every subscriber of broadcast `id`. Returns how many
    /// clients it was queued for.
    pub fn broadcast(&self, id: u32, value: &Value) -> Result<usize, CodecError> {
        let message = Message::with_value(SIGNAL_OBJECT, id, BROADCAST_COOKIE, value)?;
        let registry = self.registry.lock();
        let sent = registry
            .broadcasts
            .get(&id)
            .map_or(0, |subscribers| {
                subscribers
                    .iter()
                    .filter(|client| registry.send(**client, message.clone()))
                    .count()
            });
        debug!("Broadcast {} sent to {} clients", id, sent);
        Ok(sent)
    }

    /// Answer every client waiting on signal `id`. Waiters are one-shot: a
    /// client must request the signal again to see the next emission.
    pub fn emit_signal(&self, id: u32, value: &Value) -> Result<usize, CodecError> {
        let template = Message::with_value(SIGNAL_OBJECT, CMD_REPLY, 0, value)?;
        let mut registry = self.registry.lock();
        let waiting = registry.waiters.remove(&id).unwrap_or_default();
        let sent = waiting
            .into_iter()
            .filter(|(client, cookie)| {
                let message = Message {
                    cookie: *cookie,
                    ..template.clone()
                };
                registry.send(*client, message)
            })
            .count();
        debug!("Signal {} emitted to {} clients", id, sent);
        Ok(sent)
    }

    pub fn client_count(&self) -> usize {
        self.registry.lock().clients.len()
    }

    pub fn subscriber_count(&self, id: u32) -> usize {
        self.registry.lock().broadcasts.get(&id).map_or(0, HashSet::len)
    }

    pub fn waiter_count(&self, id: u32) -> usize {
        self.registry.lock().waiters.get(&id).map_or(0, Vec::len)
    }
}

/// Unix-socket listener serving the message protocol.
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<dyn CommandHandler>,
    handle: ServerHandle,
    max_payload: u32,
}

impl Server {
    /// Bind to `path`, replacing a stale socket file.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the stale socket cannot be removed or the bind
    /// fails.
    pub fn bind(path: impl AsRef<Path>, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind {}", path.display()))?;
        info!("Listening on {}", path.display());

        Ok(Self {
            listener,
            path,
            handler,
            handle: ServerHandle {
                registry: Arc::new(Mutex::new(Registry::default())),
            },
            max_payload: DEFAULT_MAX_PAYLOAD,
        })
    }

    /// Change the payload ceiling applied to every client.
    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept clients forever, serving each on its own task.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .context("Failed to accept client")?;
            let handler = Arc::clone(&self.handler);
            let handle = self.handle.clone();
            tokio::spawn(serve_client(stream, handler, handle, self.max_payload));
        }
    }
}

async fn serve_client(stream: UnixStream, handler: Arc<dyn CommandHandler>, server: ServerHandle, max_payload: u32) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let client = server.registry.lock().add_client(tx);
    debug!("Client {} connected", client);

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_message(&mut writer, &message, max_payload).await {
                debug!("Client {} write failed: {:#}", client, e);
                break;
            }
        }
    });

    loop {
        let message = match read_message(&mut reader, max_payload).await {
            Ok(message) => message,
            Err(e) => {
                debug!("Client {} gone: {:#}", client, e);
                break;
            }
        };
        if let Some(reply) = dispatch(&server, handler.as_ref(), client, message) {
            if !server.registry.lock().send(client, reply) {
                break;
            }
        }
    }

    // Dropping the sender ends the writer, which closes the socket.
    server.registry.lock().remove_client(client);
    if let Err(e) = writer_task.await {
        warn!("Client {} writer panicked: {}", client, e);
    }
    debug!("Client {} disconnected", client);
}

fn signal_id(message: &Message) -> Option<u32> {
    let id = message.value().ok()?.get_int()?;
    u32::try_from(id).ok()
}

fn dispatch(server: &ServerHandle, handler: &dyn CommandHandler, client: ClientId, message: Message) -> Option<Message> {
    if message.object_id == SIGNAL_OBJECT {
        match message.command_id {
            CMD_BROADCAST => {
                let Some(id) = signal_id(&message) else {
                    warn!("Client {} sent a malformed broadcast subscription", client);
                    return None;
                };
                server.registry.lock().broadcasts.entry(id).or_default().insert(client);
                debug!("Client {} subscribed to broadcast {}", client, id);
                return None;
            }
            CMD_SIGNAL => {
                let Some(id) = signal_id(&message) else {
                    warn!("Client {} sent a malformed signal request", client);
                    return None;
                };
                server
                    .registry
                    .lock()
                    .waiters
                    .entry(id)
                    .or_default()
                    .push((client, message.cookie));
                return None;
            }
            _ => {}
        }
    }

    let reply = match message.value() {
        Ok(args) => handler.handle(server, message.object_id, message.command_id, args),
        Err(e) => Value::new_error(format!("Malformed arguments: {e}")),
    };
    let command_id = if reply.is_error() { CMD_ERROR } else { CMD_REPLY };
    match Message::with_value(message.object_id, command_id, message.cookie, &reply) {
        Ok(reply) => Some(reply),
        Err(e) => {
            warn!("Cannot encode reply to client {}: {}", client, e);
            let fallback = Value::new_error(format!("Unencodable reply: {e}"));
            Message::with_value(message.object_id, CMD_ERROR, message.cookie, &fallback).ok()
        }
    }
}

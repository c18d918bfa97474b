//! IPC client engine and message protocol.
//!
//! A [`Connection`] multiplexes many outstanding requests and broadcast
//! subscriptions over one stream socket to the daemon.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   unix:// or tcp://   ┌──────────────────┐
//! │   Connection     │ ◄───────────────────► │   daemon         │
//! │ (CommandResult)  │  header + xmmsv value │ (server::Server) │
//! └──────────────────┘                       └──────────────────┘
//! ```
//!
//! # Protocol
//!
//! Every message is a fixed 16-byte big-endian header followed by a
//! serialized [`Value`](crate::Value) payload:
//!
//! ```text
//! object_id: u32 | command_id: u32 | cookie: i32 | payload_len: u32 | payload
//! ```
//!
//! Requests carry a positive cookie which the reply echoes. Broadcasts carry
//! [`BROADCAST_COOKIE`] and the broadcast id in `command_id`.
//!
//! # Usage
//!
//! ```ignore
//! use xmmsv_ipc::{Connection, Value};
//!
//! let conn = Connection::connect("unix:///tmp/xmms-ipc-1000")?;
//! let result = conn.send_command(1, 4, &Value::new_list())?;
//! let reply = result.wait()?;
//! ```
//!
//! # Threads
//!
//! A connection is single-threaded: it is neither `Send` nor `Sync`, and all
//! notifiers run on the thread that drives it, either through
//! [`CommandResult::wait`], [`Connection::wait_io`], the `io_*_handle`
//! methods from a host event loop, or [`mainloop::run`].

mod address;
mod client;
mod framing;
pub mod mainloop;
mod message;
mod result;
pub mod server;
mod transport;

pub use address::{default_path, Address, AddressError};
pub use client::{Connection, IpcError};
pub use framing::{read_message, write_message, FramingError, MessageReader};
pub use message::{Header, Message, HEADER_LEN};
pub use result::{CommandResult, ResultKind};
pub use transport::{Disconnect, Readiness, Transport};

/// Object id of the signal subsystem.
pub const SIGNAL_OBJECT: u32 = 0;

/// Reply to a request.
pub const CMD_REPLY: u32 = 0;
/// Error reply to a request; the payload is an error value.
pub const CMD_ERROR: u32 = 1;
/// One-shot request for the next emission of a signal.
pub const CMD_SIGNAL: u32 = 32;
/// Subscription to a broadcast.
pub const CMD_BROADCAST: u32 = 33;

/// Cookie carried by broadcasts. Cookies at or below it are never allocated.
pub const BROADCAST_COOKIE: i32 = 0;

/// Port used when a `tcp://` address names none.
pub const DEFAULT_TCP_PORT: u16 = 5555;

/// Default ceiling on a single payload.
pub const DEFAULT_MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

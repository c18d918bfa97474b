//! xmmsv value core and IPC client engine.
//!
//! This library provides the pieces a media-daemon client needs to talk to
//! its server:
//!
//! - `value` - the reference-counted dynamic [`Value`] (scalars, strings,
//!   binaries, lists, dicts, collection expressions, bit buffers)
//! - `serialize` - the self-describing wire encoding of values
//! - `ipc` - message framing, transports, and the [`Connection`] engine that
//!   matches replies, broadcasts and signals to [`CommandResult`] handles
//! - `config` - client settings from defaults, a JSON file and the environment
//!
//! # Example
//!
//! ```ignore
//! use xmmsv_ipc::{ClientConfig, Connection, Value};
//!
//! let conn = Connection::connect_with(&ClientConfig::from_env())?;
//! let args = Value::build_list(vec![Value::new_string("Default")]);
//! let entries = conn.send_command(2, 4, &args)?.wait()?;
//! for id in entries.list_items().unwrap_or_default() {
//!     println!("{:?}", id.get_int());
//! }
//! ```

pub mod config;
pub mod ipc;
pub mod serialize;
pub mod value;

pub use config::ClientConfig;
pub use ipc::{CommandResult, Connection, IpcError, ResultKind};
pub use serialize::{deserialize, serialize, CodecError};
pub use value::{BitBuffer, CollType, Value, ValueError, ValueType, WeakValue};

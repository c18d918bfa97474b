//! Server addresses: `unix:///path` and `tcp://host[:port]`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use url::{Host, Url};

use super::DEFAULT_TCP_PORT;
use crate::config::PATH_ENV;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address: {0}")]
    Invalid(#[from] url::ParseError),

    #[error("Unsupported address scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Address has no host: {0}")]
    MissingHost(String),

    #[error("Address has no socket path: {0}")]
    MissingPath(String),
}

/// A parsed server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl FromStr for Address {
    type Err = AddressError;

    /// Accepts `unix:///path`, `tcp://host[:port]` (IPv6 hosts in
    /// brackets) and bare absolute paths, which name a Unix socket.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            return Ok(Address::Unix(PathBuf::from(s)));
        }

        let url = Url::parse(s)?;
        match url.scheme() {
            "unix" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(AddressError::MissingPath(s.to_string()));
                }
                Ok(Address::Unix(PathBuf::from(path)))
            }
            "tcp" => {
                let host = match url.host() {
                    Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
                    Some(Host::Ipv4(ip)) => ip.to_string(),
                    Some(Host::Ipv6(ip)) => ip.to_string(),
                    _ => return Err(AddressError::MissingHost(s.to_string())),
                };
                Ok(Address::Tcp {
                    host,
                    port: url.port().unwrap_or(DEFAULT_TCP_PORT),
                })
            }
            other => Err(AddressError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix(path) => write!(f, "unix://{}", path.display()),
            Address::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Address::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

/// Resolve the default server address.
///
/// Resolution order:
/// 1. `$XMMS_PATH`
/// 2. `unix://<runtime dir>/xmms-ipc-<uid>` (`$XDG_RUNTIME_DIR` on Linux)
/// 3. `unix:///tmp/xmms-ipc-<uid>`
pub fn default_path() -> String {
    if let Some(path) = std::env::var(PATH_ENV).ok().filter(|p| !p.is_empty()) {
        return path;
    }

    let name = format!("xmms-ipc-{}", current_uid());
    let dir = dirs::runtime_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    format!("unix://{}", dir.join(name).display())
}

fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

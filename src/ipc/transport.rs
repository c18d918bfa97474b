//! Non-blocking stream socket with a receive buffer and a FIFO send queue.
//!
//! The transport knows nothing about messages: it moves bytes. Partial reads
//! and writes are normal. End of stream, a hard socket error, or a local
//! [`Transport::disconnect`] moves it to the disconnected state, and that
//! transition is returned exactly once as `Some(Disconnect)`.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use tracing::{debug, info, trace};

use super::address::Address;

const READ_CHUNK: usize = 64 * 1024;

/// Most bytes taken off the socket by one [`Transport::handle_readable`] pass.
pub const READ_BUDGET: usize = 16 * READ_CHUNK;

/// Why a transport stopped.
#[derive(Debug)]
pub enum Disconnect {
    /// Peer closed the stream.
    Eof,
    /// Hard socket error.
    Error(io::Error),
    /// Closed locally.
    Local,
    /// Closed after the peer sent an undecodable stream.
    Protocol(String),
}

/// Poll result for [`Transport::poll`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug)]
enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Unix(s) => s.as_raw_fd(),
            Stream::Tcp(s) => s.as_raw_fd(),
        }
    }
}

/// One connected socket.
#[derive(Debug)]
pub struct Transport {
    stream: Stream,
    received: Vec<u8>,
    send_queue: VecDeque<Vec<u8>>,
    /// Bytes of the front queue entry already written.
    send_offset: usize,
    read_budget: usize,
    /// The last read pass stopped at its budget, not at `WouldBlock`.
    input_pending: bool,
    connected: bool,
}

impl Transport {
    /// Connect to `address` and switch the socket to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns the connect error, e.g. `NotFound` for a missing socket file
    /// or `ConnectionRefused` when nothing is listening.
    pub fn connect(address: &Address) -> io::Result<Self> {
        let stream = match address {
            Address::Unix(path) => Stream::Unix(UnixStream::connect(path)?),
            Address::Tcp { host, port } => {
                let tcp = TcpStream::connect((host.as_str(), *port))?;
                tcp.set_nodelay(true)?;
                Stream::Tcp(tcp)
            }
        };
        info!("Connected to {}", address);
        Self::from_stream(stream)
    }

    /// Wrap an already connected Unix socket.
    pub fn from_unix(stream: UnixStream) -> io::Result<Self> {
        Self::from_stream(Stream::Unix(stream))
    }

    /// Wrap an already connected TCP socket.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        Self::from_stream(Stream::Tcp(stream))
    }

    fn from_stream(stream: Stream) -> io::Result<Self> {
        match &stream {
            Stream::Unix(s) => s.set_nonblocking(true)?,
            Stream::Tcp(s) => s.set_nonblocking(true)?,
        }
        Ok(Self {
            stream,
            received: Vec::new(),
            send_queue: VecDeque::new(),
            send_offset: 0,
            read_budget: READ_BUDGET,
            input_pending: false,
            connected: true,
        })
    }

    /// Descriptor for registration with an external event loop.
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether queued bytes are waiting for the socket to become writable.
    pub fn want_out(&self) -> bool {
        self.connected && !self.send_queue.is_empty()
    }

    /// Bytes queued but not yet written.
    pub fn queued_len(&self) -> usize {
        self.send_queue.iter().map(Vec::len).sum::<usize>() - self.send_offset
    }

    /// Queue `bytes` behind everything already queued.
    pub fn enqueue(&mut self, bytes: Vec<u8>) {
        if self.connected && !bytes.is_empty() {
            self.send_queue.push_back(bytes);
        }
    }

    /// Take everything received so far.
    pub fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.received)
    }

    /// Read until the socket would block or [`READ_BUDGET`] bytes have
    /// arrived, whichever comes first.
    ///
    /// After a pass that hit the budget [`Transport::input_pending`] holds
    /// and the caller should take the received bytes and read again.
    pub fn handle_readable(&mut self) -> Option<Disconnect> {
        self.input_pending = false;
        if !self.connected {
            return None;
        }
        let mut budget = self.read_budget;
        let mut chunk = vec![0u8; READ_CHUNK.min(budget)];
        while budget > 0 {
            let want = chunk.len().min(budget);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => return self.close(Disconnect::Eof),
                Ok(n) => {
                    trace!("Read {} bytes", n);
                    self.received.extend_from_slice(&chunk[..n]);
                    budget -= n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.close(Disconnect::Error(e)),
            }
        }
        self.input_pending = true;
        None
    }

    /// Whether the socket may still hold unread bytes after the last
    /// [`Transport::handle_readable`] pass.
    pub fn input_pending(&self) -> bool {
        self.connected && self.input_pending
    }

    /// Write queued bytes until the queue is empty or the socket would block.
    pub fn handle_writable(&mut self) -> Option<Disconnect> {
        while self.connected {
            let Some(front) = self.send_queue.front() else {
                return None;
            };
            match self.stream.write(&front[self.send_offset..]) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes");
                    return self.close(Disconnect::Error(err));
                }
                Ok(n) => {
                    self.send_offset += n;
                    if self.send_offset == front.len() {
                        self.send_queue.pop_front();
                        self.send_offset = 0;
                    } else {
                        trace!("Short write: {} bytes, {} left", n, front.len() - self.send_offset);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.close(Disconnect::Error(e)),
            }
        }
        None
    }

    /// Close the socket locally. Returns `Some` only on the first call.
    pub fn disconnect(&mut self) -> Option<Disconnect> {
        self.close(Disconnect::Local)
    }

    /// Close after a protocol violation by the peer.
    pub fn abort(&mut self, reason: String) -> Option<Disconnect> {
        self.close(Disconnect::Protocol(reason))
    }

    /// The socket stays open until drop so the descriptor remains valid for
    /// any event loop still watching it.
    fn close(&mut self, reason: Disconnect) -> Option<Disconnect> {
        if !self.connected {
            return None;
        }
        self.connected = false;
        self.send_queue.clear();
        self.send_offset = 0;
        if let Err(e) = self.stream.shutdown() {
            debug!("Shutdown after disconnect failed: {}", e);
        }
        info!("Transport disconnected: {:?}", reason);
        Some(reason)
    }

    /// Block until the socket is readable, or writable while [`want_out`]
    /// holds, or until `timeout` passes.
    ///
    /// [`want_out`]: Transport::want_out
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Readiness> {
        let mut events = libc::POLLIN;
        if self.want_out() {
            events |= libc::POLLOUT;
        }
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events,
            revents: 0,
        };
        let timeout_ms = match timeout {
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };

        // SAFETY: `pfd` is a valid pollfd for the duration of the call and
        // the count passed is 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::default());
            }
            return Err(err);
        }

        let hangup = pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0;
        Ok(Readiness {
            readable: pfd.revents & libc::POLLIN != 0 || hangup,
            writable: pfd.revents & libc::POLLOUT != 0,
        })
    }
}

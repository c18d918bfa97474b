//! Driving a [`Connection`] from a tokio runtime.
//!
//! The connection itself never blocks on its own; this adapter registers its
//! descriptor with the reactor and calls the in/out handlers on readiness.
//! Results stay single-threaded, so run it on a current-thread runtime or
//! inside a `LocalSet`.

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::debug;

use super::client::{Connection, IpcError};

/// Dispatch messages for `conn` until it disconnects.
///
/// # Errors
///
/// Returns `IpcError::Io` if the descriptor cannot be registered with the
/// reactor (for example when called outside a runtime with I/O enabled).
///
/// # Example
///
/// ```ignore
/// let conn = Connection::connect("unix:///tmp/xmms-ipc-1000")?;
/// let volume = conn.subscribe_broadcast(2)?;
/// volume.set_notifier(|v| println!("volume {:?}", v));
///
/// tokio::task::LocalSet::new()
///     .run_until(mainloop::run(&conn))
///     .await?;
/// ```
pub async fn run(conn: &Connection) -> Result<(), IpcError> {
    let fd = AsyncFd::with_interest(conn.io_fd(), Interest::READABLE | Interest::WRITABLE)?;
    let out_queued = conn.out_queued();

    // Bytes may already be waiting from before registration.
    conn.io_in_handle();

    while conn.is_connected() {
        if conn.io_want_out() {
            tokio::select! {
                guard = fd.readable() => {
                    let mut guard = guard?;
                    conn.io_in_handle();
                    if !conn.io_input_pending() {
                        guard.clear_ready();
                    }
                }
                guard = fd.writable() => {
                    let mut guard = guard?;
                    conn.io_out_handle();
                    // Writable readiness is only consumed by a full socket.
                    if conn.io_want_out() {
                        guard.clear_ready();
                    }
                }
            }
        } else {
            tokio::select! {
                guard = fd.readable() => {
                    let mut guard = guard?;
                    conn.io_in_handle();
                    if !conn.io_input_pending() {
                        guard.clear_ready();
                    }
                }
                // A send made while parked here left bytes queued.
                () = out_queued.notified() => {}
            }
        }
    }

    debug!("Main loop finished: connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{read_message, write_message, Message, BROADCAST_COOKIE, CMD_REPLY, DEFAULT_MAX_PAYLOAD};
    use crate::Value;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_run_flushes_commands_sent_while_parked() {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair().expect("Failed to create socket pair");
        theirs.set_nonblocking(true).unwrap();
        let mut peer = tokio::net::UnixStream::from_std(theirs).unwrap();
        let conn = Rc::new(Connection::from_unix_stream(ours, DEFAULT_MAX_PAYLOAD).unwrap());

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let driver = {
                    let conn = Rc::clone(&conn);
                    tokio::task::spawn_local(async move { run(&conn).await })
                };
                // Let the loop park with nothing queued.
                tokio::task::yield_now().await;
                assert!(!conn.io_want_out());

                let blob = vec![0x5au8; 4 * 1024 * 1024];
                let result = conn.send_command(6, 2, &Value::new_binary(blob)).unwrap();
                assert!(conn.io_want_out(), "payload fit the socket buffer");

                let server = tokio::spawn(async move {
                    let request = read_message(&mut peer, DEFAULT_MAX_PAYLOAD).await.expect("command");
                    let size = request.value().unwrap().get_binary().map_or(0, |b| b.len());
                    let reply = Message::with_value(6, CMD_REPLY, request.cookie, &Value::from(size as i64)).unwrap();
                    write_message(&mut peer, &reply, DEFAULT_MAX_PAYLOAD).await.unwrap();
                });

                timeout(TEST_TIMEOUT, server).await.expect("Request never flushed").unwrap();
                timeout(TEST_TIMEOUT, driver)
                    .await
                    .expect("Test timed out")
                    .unwrap()
                    .expect("Main loop failed");
                assert_eq!(result.value().and_then(|v| v.get_int()), Some(4 * 1024 * 1024));
            })
            .await;
    }

    #[tokio::test]
    async fn test_run_dispatches_until_disconnect() {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair().expect("Failed to create socket pair");
        theirs.set_nonblocking(true).unwrap();
        let mut peer = tokio::net::UnixStream::from_std(theirs).unwrap();
        let conn = Connection::from_unix_stream(ours, DEFAULT_MAX_PAYLOAD).unwrap();

        let command = conn.send_command(4, 1, &Value::new_string("status")).unwrap();
        let subscription = conn.subscribe_broadcast(9).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        subscription.set_notifier(move |v| sink.borrow_mut().push(v.clone()));

        let server = tokio::spawn(async move {
            let request = read_message(&mut peer, DEFAULT_MAX_PAYLOAD).await.expect("command");
            let _subscribe = read_message(&mut peer, DEFAULT_MAX_PAYLOAD).await.expect("subscribe");

            let reply = Message::with_value(4, CMD_REPLY, request.cookie, &Value::new_int(1)).unwrap();
            write_message(&mut peer, &reply, DEFAULT_MAX_PAYLOAD).await.unwrap();
            for n in [10, 20] {
                let fired = Message::with_value(0, 9, BROADCAST_COOKIE, &Value::new_int(n)).unwrap();
                write_message(&mut peer, &fired, DEFAULT_MAX_PAYLOAD).await.unwrap();
            }
        });

        timeout(TEST_TIMEOUT, run(&conn))
            .await
            .expect("Test timed out")
            .expect("Main loop failed");
        server.await.unwrap();

        assert_eq!(command.value().and_then(|v| v.get_int()), Some(1));
        let seen = seen.borrow();
        let ints: Vec<_> = seen.iter().filter_map(Value::get_int).collect();
        assert_eq!(ints, vec![10, 20]);
        // The close itself reaches the subscriber as an error.
        assert!(seen.last().is_some_and(Value::is_error));
        assert!(subscription.is_error());
    }
}

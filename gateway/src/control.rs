//! The control channel: a `TcpListener` accept loop plus one reader thread per accepted
//! connection, framing each message as a 4-byte big-endian length prefix followed by a
//! JSON payload (the concrete choice resolving §6's "message-preserving transport" open
//! question, see DESIGN.md).
//!
//! Connections never block the main thread: every accepted socket gets its own reader
//! thread that forwards parsed messages onto the main event channel, and only the main
//! thread ever writes a response (via the [`ClientId`]-indexed write-handle table it
//! owns).

use std::io::{self, Read as _, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::thread;

use crate::eventloop::MainEvent;

pub type ClientId = u64;

const MAX_MESSAGE_LEN: u32 = 16 * 1024 * 1024;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Reads one length-prefixed JSON message, or `Ok(None)` on a clean transport close.
pub fn read_message(stream: &mut TcpStream) -> io::Result<Option<serde_json::Value>> {
    let mut len_buf = [0u8; 4];
    if let Err(error) = stream.read_exact(&mut len_buf) {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(error);
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_LEN {
        return Err(io::Error::other(format!(
            "control message length {len} exceeds maximum {MAX_MESSAGE_LEN}"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;

    let value = serde_json::from_slice(&payload)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;

    Ok(Some(value))
}

/// Writes one length-prefixed JSON message.
pub fn write_message(stream: &mut TcpStream, value: &serde_json::Value) -> io::Result<()> {
    let payload = serde_json::to_vec(value).expect("serde_json::Value always serializes");
    let len = u32::try_from(payload.len()).map_err(io::Error::other)?;

    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&payload)?;

    Ok(())
}

/// Binds and spawns the accept loop on its own thread; each accepted connection gets its
/// own reader thread forwarding parsed messages to `tx`.
pub fn spawn_acceptor(listener: TcpListener, tx: Sender<MainEvent>) {
    thread::Builder::new()
        .name("gtp-control-accept".to_owned())
        .spawn(move || accept_loop(listener, tx))
        .expect("spawning the accept thread should not fail under normal OS conditions");
}

fn accept_loop(listener: TcpListener, tx: Sender<MainEvent>) {
    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(%error, "Failed to accept control connection");
                continue;
            }
        };

        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);

        let write_handle = match stream.try_clone() {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(%error, "Failed to clone accepted control connection");
                continue;
            }
        };

        if tx
            .send(MainEvent::ClientConnected {
                id,
                stream: write_handle,
            })
            .is_err()
        {
            return;
        }

        spawn_reader(id, stream, tx.clone());
    }
}

fn spawn_reader(id: ClientId, mut stream: TcpStream, tx: Sender<MainEvent>) {
    thread::Builder::new()
        .name(format!("gtp-control-{id}"))
        .spawn(move || {
            loop {
                match read_message(&mut stream) {
                    Ok(Some(value)) => {
                        if tx.send(MainEvent::Command { id, value }).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(id, "Control connection closed");
                        let _ = tx.send(MainEvent::ClientDisconnected { id });
                        return;
                    }
                    Err(error) => {
                        tracing::warn!(id, %error, "Control connection read error");
                        let _ = tx.send(MainEvent::ClientDisconnected { id });
                        return;
                    }
                }
            }
        })
        .expect("spawning a connection reader thread should not fail under normal OS conditions");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_a_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let value = serde_json::json!({"reset_all_state": {}});
        write_message(&mut client, &value).unwrap();

        let received = read_message(&mut server).unwrap().unwrap();
        assert_eq!(received, value);
    }

    #[test]
    fn clean_close_reads_as_none() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        drop(client);

        assert!(read_message(&mut server).unwrap().is_none());
    }
}

//! A client for the daemon's control protocol. Connects, performs the
//! handshake, and spawns a receiver thread that hands every subsequent byte
//! to a caller-supplied sink. The sink must not block — there is no
//! buffering between the socket and the sink beyond what the OS provides.
//!
//! `Input` frames carry UTF-8 text. A client with arbitrary (possibly
//! non-UTF-8) bytes to send must not wrap them in a `connect` handshake at
//! all: send them as the very first message before any control frame is
//! recognized is not supported, and no raw-mode escape hatch exists in this
//! library — see `BadControlFrame` in `crate::error` and SPEC_FULL.md's
//! Open Question on this asymmetry. Use `ptyattach`'s approach (forwarding
//! stdin bytes as UTF-8-lossy `Input` frames) as the reference pattern.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{PtyMasterError, Result};
use crate::protocol::ControlFrame;

const HANDSHAKE_BUF: usize = 1024;
const RECEIVE_CHUNK: usize = 4096;

/// Receives bytes pushed by the daemon after a successful connect.
pub trait Sink: Send + 'static {
    fn on_data(&mut self, data: &[u8]);
}

impl<F: FnMut(&[u8]) + Send + 'static> Sink for F {
    fn on_data(&mut self, data: &[u8]) {
        self(data)
    }
}

pub struct PtyClient {
    stream: UnixStream,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl PtyClient {
    /// Connects to `endpoint`, joins `session_id`, and starts forwarding
    /// every byte the daemon sends to `sink` on a background thread.
    pub fn connect(endpoint: impl AsRef<Path>, session_id: &str, sink: impl Sink) -> Result<Self> {
        let mut stream = UnixStream::connect(endpoint.as_ref())
            .map_err(|err| PtyMasterError::HandshakeFailed(err.to_string()))?;

        let frame = ControlFrame::connect(session_id).encode()?;
        stream.write_all(&frame)?;

        let mut buf = [0u8; HANDSHAKE_BUF];
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(PtyMasterError::HandshakeFailed(
                "daemon closed the connection during handshake".to_string(),
            ));
        }
        match ControlFrame::decode(&buf[..n]) {
            Ok(ControlFrame::Connected { .. }) => {}
            _ => {
                return Err(PtyMasterError::HandshakeFailed(
                    "expected a connected frame".to_string(),
                ))
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let receiver = spawn_receiver(stream.try_clone()?, Arc::clone(&running), sink);

        Ok(PtyClient {
            stream,
            running,
            receiver: Some(receiver),
        })
    }

    pub fn send_input(&mut self, data: &str) -> Result<()> {
        let frame = ControlFrame::input(data).encode()?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    pub fn send_resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        let frame = ControlFrame::resize(rows, cols).encode()?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Stops the receiver thread and closes the socket. Safe to call more
    /// than once.
    pub fn disconnect(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PtyClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn spawn_receiver(
    mut stream: UnixStream,
    running: Arc<AtomicBool>,
    mut sink: impl Sink,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; RECEIVE_CHUNK];
        while running.load(Ordering::SeqCst) {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => sink.on_data(&buf[..n]),
                Err(ref err)
                    if err.kind() == std::io::ErrorKind::Interrupted
                        || err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn handshake_failure_surfaces_when_endpoint_is_missing() {
        let missing = std::env::temp_dir().join("ptymaster-test-missing.sock");
        let (tx, _rx) = mpsc::channel::<Vec<u8>>();
        let result = PtyClient::connect(&missing, "default", move |data: &[u8]| {
            let _ = tx.send(data.to_vec());
        });
        assert!(result.is_err());
    }
}

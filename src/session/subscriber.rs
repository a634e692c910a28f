//! A subscriber is one client's write-half of its socket connection. The
//! session reader pushes bytes to every subscriber without ever blocking on
//! a slow one: pending bytes that a non-blocking write can't accept yet are
//! queued, and a subscriber is dropped outright on a hard socket error.

use std::io::{self, Write};
use std::os::unix::net::UnixStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

pub struct Subscriber {
    pub id: SubscriberId,
    stream: UnixStream,
    pending: Vec<u8>,
}

impl Subscriber {
    pub fn new(id: SubscriberId, stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Subscriber {
            id,
            stream,
            pending: Vec::new(),
        })
    }

    /// Sends `data`, queuing whatever a non-blocking write can't accept
    /// right now. Returns `Err` only on a fatal condition (broken pipe,
    /// connection reset) that means the subscriber must be reaped.
    pub fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.pending.extend_from_slice(data);
            return self.flush_pending();
        }
        match self.stream.write(data) {
            Ok(n) if n == data.len() => Ok(()),
            Ok(n) => {
                self.pending.extend_from_slice(&data[n..]);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.pending.extend_from_slice(data);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Attempts to drain queued bytes. Call this periodically (the reader
    /// loop does so every cycle) so a subscriber that was briefly slow
    /// catches back up instead of growing its queue forever.
    pub fn flush_pending(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn try_clone_stream(&self) -> io::Result<UnixStream> {
        self.stream.try_clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn send_buffers_when_socket_would_block() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sub = Subscriber::new(SubscriberId(1), a).unwrap();

        let chunk = vec![0u8; 64 * 1024];
        for _ in 0..64 {
            sub.send(&chunk).unwrap();
        }
        assert!(!sub.pending.is_empty(), "expected backpressure to queue bytes");

        let mut reader = b;
        reader.set_nonblocking(true).unwrap();
        let mut sink = [0u8; 64 * 1024];
        loop {
            match reader.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        sub.flush_pending().unwrap();
    }

    #[test]
    fn send_to_closed_peer_eventually_errors() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let mut sub = Subscriber::new(SubscriberId(2), a).unwrap();
        let big = vec![1u8; 1024 * 1024];
        let mut saw_error = false;
        for _ in 0..64 {
            if sub.send(&big).is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error, "writing to a closed peer should eventually fail");
    }
}

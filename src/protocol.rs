//! The daemon's wire protocol: a small set of JSON control frames interleaved
//! with opaque bytes. Client to daemon frames are `connect`, `resize`, and
//! `input`; the daemon only ever sends one frame, `connected`, before
//! switching to raw PTY output for the rest of the connection's life.

use serde::{Deserialize, Serialize};

use crate::error::{PtyMasterError, Result};

pub const MAX_FRAME_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Connect { session_id: String },
    Connected { session_id: String },
    Resize { rows: u16, cols: u16 },
    Input { data: String },
}

impl ControlFrame {
    pub fn connect(session_id: impl Into<String>) -> Self {
        ControlFrame::Connect {
            session_id: session_id.into(),
        }
    }

    pub fn connected(session_id: impl Into<String>) -> Self {
        ControlFrame::Connected {
            session_id: session_id.into(),
        }
    }

    pub fn resize(rows: u16, cols: u16) -> Self {
        ControlFrame::Resize {
            rows: rows.clamp(1, 1000),
            cols: cols.clamp(1, 1000),
        }
    }

    pub fn input(data: impl Into<String>) -> Self {
        ControlFrame::Input { data: data.into() }
    }

    /// Serializes to a single JSON line (trailing `\n`), the shape every
    /// frame is sent in on the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Tries to parse `bytes` as a single control frame. Callers that get
    /// `Err` should fall back to treating `bytes` as opaque PTY input rather
    /// than closing the connection — see the daemon's loop-mode dispatch.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let trimmed = trim_trailing_newline(bytes);
        serde_json::from_slice(trimmed).map_err(|_| PtyMasterError::BadControlFrame)
    }

    /// Best-effort decode used by the daemon's loop-mode dispatch: `None`
    /// means "not a control frame, forward verbatim as raw input".
    pub fn try_decode(bytes: &[u8]) -> Option<Self> {
        Self::decode(bytes).ok()
    }
}

fn trim_trailing_newline(bytes: &[u8]) -> &[u8] {
    match bytes.split_last() {
        Some((b'\n', rest)) => rest,
        _ => bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_round_trips() {
        let frame = ControlFrame::connect("abc123");
        let encoded = frame.encode().unwrap();
        let decoded = ControlFrame::decode(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn connected_round_trips() {
        let frame = ControlFrame::connected("default");
        let encoded = frame.encode().unwrap();
        assert_eq!(ControlFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn resize_clamps_to_bounds() {
        let frame = ControlFrame::resize(0, u16::MAX);
        match frame {
            ControlFrame::Resize { rows, cols } => {
                assert_eq!(rows, 1);
                assert_eq!(cols, 1000);
            }
            _ => panic!("expected resize"),
        }
    }

    #[test]
    fn input_round_trips_utf8() {
        let frame = ControlFrame::input("ls -la\n");
        let encoded = frame.encode().unwrap();
        assert_eq!(ControlFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn decode_wire_shapes_from_the_python_original() {
        let raw = br#"{"type":"connect","session_id":"xyz"}"#;
        assert_eq!(
            ControlFrame::decode(raw).unwrap(),
            ControlFrame::connect("xyz")
        );
    }

    #[test]
    fn garbage_bytes_fail_to_decode_and_signal_raw_fallback() {
        let raw = b"echo hi\n";
        assert!(ControlFrame::try_decode(raw).is_none());
    }

    #[test]
    fn empty_bytes_fail_to_decode() {
        assert!(ControlFrame::try_decode(b"").is_none());
    }
}

//! Streaming parser for the CSI (`ESC '[' params final`) subset the screen
//! buffer understands. A regex-over-buffered-text approach can't parse a
//! sequence split across two `write` calls; this is why the state is kept
//! explicit and fed one byte at a time.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Ground,
    Escape,
    CsiParams,
}

/// One decoded step of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A plain byte to be written to the grid (control bytes included; the
    /// caller still has to apply `\n`/`\r`/`\b`/`\t` semantics).
    Plain(u8),
    /// A complete CSI sequence: final byte plus its numeric parameters in
    /// order, defaulted params omitted (caller applies the per-final default).
    Csi { final_byte: char, params: Vec<i64> },
    /// Byte consumed as part of an in-progress escape sequence; nothing to
    /// render yet.
    Pending,
}

#[derive(Debug, Default)]
pub struct Parser {
    state: State,
    param_buf: String,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, byte: u8) -> Event {
        match self.state {
            State::Ground => {
                if byte == 0x1b {
                    self.state = State::Escape;
                    Event::Pending
                } else {
                    Event::Plain(byte)
                }
            }
            State::Escape => {
                if byte == b'[' {
                    self.state = State::CsiParams;
                    self.param_buf.clear();
                    Event::Pending
                } else {
                    // Unsupported two-byte escape; drop back to ground and
                    // discard the ESC and this byte.
                    self.state = State::Ground;
                    Event::Pending
                }
            }
            State::CsiParams => {
                if byte.is_ascii_digit() || byte == b';' {
                    self.param_buf.push(byte as char);
                    Event::Pending
                } else if byte.is_ascii_alphabetic() {
                    // An omitted param (two adjacent `;`, or a leading/trailing
                    // one) means 0, not "absent" — it must keep its position
                    // so e.g. `1;;5` parses as `[1, 0, 5]`, not `[1, 5]`.
                    let params = if self.param_buf.is_empty() {
                        Vec::new()
                    } else {
                        self.param_buf
                            .split(';')
                            .map(|s| s.parse::<i64>().unwrap_or(0))
                            .collect()
                    };
                    self.state = State::Ground;
                    self.param_buf.clear();
                    Event::Csi {
                        final_byte: byte as char,
                        params,
                    }
                } else {
                    // Malformed sequence; abandon it.
                    self.state = State::Ground;
                    self.param_buf.clear();
                    Event::Pending
                }
            }
        }
    }
}

/// Returns `params[index]`, or `default` if the parameter was omitted or is
/// zero (CSI's convention: an explicit `0` means "use the default" for most
/// finals, e.g. `CSI 0 A` moves the cursor up by one, not by zero).
pub fn param_or(params: &[i64], index: usize, default: i64) -> i64 {
    match params.get(index) {
        Some(&value) if value != 0 => value,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(bytes: &[u8]) -> Vec<Event> {
        let mut parser = Parser::new();
        bytes
            .iter()
            .map(|&byte| parser.feed(byte))
            .filter(|event| *event != Event::Pending)
            .collect()
    }

    #[test]
    fn plain_bytes_pass_through() {
        assert_eq!(run(b"AB"), vec![Event::Plain(b'A'), Event::Plain(b'B')]);
    }

    #[test]
    fn parses_cursor_up() {
        assert_eq!(
            run(b"\x1b[3A"),
            vec![Event::Csi {
                final_byte: 'A',
                params: vec![3]
            }]
        );
    }

    #[test]
    fn parses_sgr_with_no_params_as_reset() {
        assert_eq!(
            run(b"\x1b[m"),
            vec![Event::Csi {
                final_byte: 'm',
                params: vec![]
            }]
        );
    }

    #[test]
    fn parses_multi_param_cursor_position() {
        assert_eq!(
            run(b"\x1b[5;10H"),
            vec![Event::Csi {
                final_byte: 'H',
                params: vec![5, 10]
            }]
        );
    }

    #[test]
    fn split_sequence_across_two_feeds_still_parses() {
        let mut parser = Parser::new();
        let mut events = Vec::new();
        for &byte in b"\x1b[2" {
            events.push(parser.feed(byte));
        }
        for &byte in b"J" {
            events.push(parser.feed(byte));
        }
        let real: Vec<_> = events.into_iter().filter(|e| *e != Event::Pending).collect();
        assert_eq!(
            real,
            vec![Event::Csi {
                final_byte: 'J',
                params: vec![2]
            }]
        );
    }

    #[test]
    fn omitted_middle_param_keeps_its_position() {
        assert_eq!(
            run(b"\x1b[1;;5H"),
            vec![Event::Csi {
                final_byte: 'H',
                params: vec![1, 0, 5]
            }]
        );
    }

    #[test]
    fn param_or_treats_zero_as_default() {
        assert_eq!(param_or(&[0], 0, 1), 1);
        assert_eq!(param_or(&[], 0, 1), 1);
        assert_eq!(param_or(&[5], 0, 1), 5);
    }
}

//! PTY allocation and raw-mode configuration for the session's slave side.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::pty::{openpty, OpenptyResult};
use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices};

use crate::error::{PtyMasterError, Result};

pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocates a fresh PTY pair and puts the slave side in raw mode per
/// SPEC_FULL.md §4.1: no echo, no canonical editing, no signal generation,
/// 8-bit clean, `VMIN=1`/`VTIME=0`.
pub fn allocate(rows: u16, cols: u16) -> Result<PtyPair> {
    let OpenptyResult { master, slave } =
        openpty(None, None).map_err(|_| PtyMasterError::PtyAllocFailed)?;
    set_raw_mode(slave.as_raw_fd())?;
    set_window_size(slave.as_raw_fd(), rows, cols)?;
    Ok(PtyPair { master, slave })
}

fn set_raw_mode(fd: RawFd) -> Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut attrs = termios::tcgetattr(borrowed)?;

    attrs.input_flags.remove(
        InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON,
    );
    attrs.output_flags.remove(OutputFlags::OPOST);
    attrs.local_flags.remove(
        LocalFlags::ECHO
            | LocalFlags::ECHONL
            | LocalFlags::ICANON
            | LocalFlags::ISIG
            | LocalFlags::IEXTEN,
    );
    attrs.control_flags.remove(termios::ControlFlags::PARENB);
    attrs.control_flags.insert(termios::ControlFlags::CS8);
    attrs.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    attrs.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &attrs)?;
    Ok(())
}

/// Propagates a window-size change onto a PTY fd (slave or master, both
/// accept `TIOCSWINSZ`).
pub fn set_window_size(fd: RawFd, rows: u16, cols: u16) -> Result<()> {
    let size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &size) };
    if ret != 0 {
        return Err(PtyMasterError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

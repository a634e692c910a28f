//! A `Session` owns one PTY pair and the shell process attached to its
//! slave side. A dedicated reader thread waits for master readability and
//! fans output out to every attached subscriber; the daemon holds sessions
//! in a registry keyed by session id (see `crate::daemon`).

mod pty;
mod subscriber;

pub use subscriber::{Subscriber, SubscriberId};

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, dup2, execvp, fork, setsid, ForkResult, Pid};
use tracing::{debug, info, warn};

use crate::error::{PtyMasterError, Result};

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;
const READ_CHUNK: usize = 4096;
const POLL_TIMEOUT_MS: u16 = 100;
const CHILD_REAP_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_RETRY_BOUND: Duration = Duration::from_millis(100);

/// Where the child shell's state currently is; mirrors SPEC_FULL.md §4.1's
/// state table, collapsed to what callers actually need to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    Exited,
}

pub struct Session {
    id: String,
    master: OwnedFd,
    slave: OwnedFd,
    child_pid: Pid,
    state: Mutex<ChildState>,
    subscribers: Mutex<HashMap<SubscriberId, Arc<Mutex<Subscriber>>>>,
    next_subscriber_id: AtomicU64,
    running: Arc<AtomicBool>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Allocates a PTY, forks a child that execs `shell -l`, and starts the
    /// reader thread. `shell` defaults to `$SHELL` or `/bin/bash` at the
    /// call site (see `crate::daemon::Daemon`).
    pub fn open(id: impl Into<String>, shell: &str, rows: u16, cols: u16) -> Result<Arc<Session>> {
        let id = id.into();
        let pair = pty::allocate(rows, cols)?;

        match unsafe { fork() }.map_err(|_| PtyMasterError::ForkFailed)? {
            ForkResult::Child => {
                drop(pair.master);
                exec_shell_or_exit(pair.slave.into_raw_fd(), shell);
            }
            ForkResult::Parent { child } => {
                set_nonblocking(pair.master.as_raw_fd())?;

                let session = Arc::new(Session {
                    id: id.clone(),
                    master: pair.master,
                    slave: pair.slave,
                    child_pid: child,
                    state: Mutex::new(ChildState::Running),
                    subscribers: Mutex::new(HashMap::new()),
                    next_subscriber_id: AtomicU64::new(1),
                    running: Arc::new(AtomicBool::new(true)),
                    reader_handle: Mutex::new(None),
                });

                info!(session = %id, pid = child.as_raw(), "session started");
                let handle = spawn_reader(Arc::clone(&session));
                *session.reader_handle.lock().unwrap() = Some(handle);
                Ok(session)
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ChildState {
        *self.state.lock().unwrap()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ChildState::Running
    }

    /// Attaches a subscriber; returns its id so the caller can `detach` it
    /// later. Never blocks.
    pub fn attach(&self, stream: UnixStream) -> Result<SubscriberId> {
        let id = SubscriberId(self.next_subscriber_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Subscriber::new(id, stream)?;
        self.subscribers
            .lock()
            .unwrap()
            .insert(id, Arc::new(Mutex::new(subscriber)));
        debug!(session = %self.id, subscriber = id.0, "subscriber attached");
        Ok(id)
    }

    pub fn detach(&self, id: SubscriberId) {
        if self.subscribers.lock().unwrap().remove(&id).is_some() {
            debug!(session = %self.id, subscriber = id.0, "subscriber detached");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Writes bytes to the PTY master, i.e. keystrokes headed to the shell.
    /// A shell that stops draining its input (flow control, a stuck full-
    /// screen program) gets `WRITE_RETRY_BOUND` of retries before the
    /// remaining bytes are logged and dropped rather than blocking forever.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.master.as_raw_fd()) };
        let deadline = std::time::Instant::now() + WRITE_RETRY_BOUND;
        let mut written = 0;
        while written < data.len() {
            match unistd::write(fd, &data[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EAGAIN) => {
                    if std::time::Instant::now() >= deadline {
                        warn!(
                            session = %self.id,
                            dropped = data.len() - written,
                            "pty write stalled past the retry bound; dropping remaining bytes"
                        );
                        return Ok(());
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => return Err(PtyMasterError::from(err)),
            }
        }
        Ok(())
    }

    /// Propagates a resize onto the PTY and notifies the child's process
    /// group so full-screen programs redraw.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let rows = rows.clamp(1, 1000);
        let cols = cols.clamp(1, 1000);
        pty::set_window_size(self.master.as_raw_fd(), rows, cols)?;
        pty::set_window_size(self.slave.as_raw_fd(), rows, cols)?;
        let _ = signal::killpg(self.child_pid, Signal::SIGWINCH);
        Ok(())
    }

    /// Stops the reader, terminates the child (SIGTERM, then SIGKILL if it
    /// doesn't exit within `CHILD_REAP_TIMEOUT`), and reaps it. A no-op on a
    /// session whose child already exited and was reaped by the reader
    /// thread on its own (checked with a live `waitpid`, not the `state`
    /// flag, since only the reader thread is allowed to flip that flag on
    /// an actual exit).
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
            Err(nix::errno::Errno::ECHILD) => {
                // Already reaped by the reader thread on natural exit.
            }
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                *self.state.lock().unwrap() = ChildState::Exited;
            }
            _ => {
                let _ = signal::kill(self.child_pid, Signal::SIGTERM);
                let deadline = std::time::Instant::now() + CHILD_REAP_TIMEOUT;
                loop {
                    match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::StillAlive) => {
                            if std::time::Instant::now() >= deadline {
                                let _ = signal::kill(self.child_pid, Signal::SIGKILL);
                                let _ = waitpid(self.child_pid, None);
                                break;
                            }
                            thread::sleep(Duration::from_millis(20));
                        }
                        _ => break,
                    }
                }
                *self.state.lock().unwrap() = ChildState::Exited;
            }
        }
        self.subscribers.lock().unwrap().clear();
        info!(session = %self.id, "session closed");
    }

    fn mark_exited(&self) {
        *self.state.lock().unwrap() = ChildState::Exited;
    }

    /// Snapshots the subscriber list under the lock, sends outside of it,
    /// then reacquires the lock only to prune the ones that failed. Keeps
    /// `attach`/`detach`/`subscriber_count` from stalling on a slow send.
    fn broadcast(&self, data: &[u8]) {
        let snapshot: Vec<(SubscriberId, Arc<Mutex<Subscriber>>)> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.iter().map(|(id, sub)| (*id, Arc::clone(sub))).collect()
        };

        let mut dead = Vec::new();
        for (id, sub) in snapshot {
            if let Err(err) = sub.lock().unwrap().send(data) {
                debug!(session = %self.id, subscriber = id.0, error = %err, "dropping subscriber");
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.lock().unwrap();
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    fn flush_subscribers(&self) {
        let snapshot: Vec<(SubscriberId, Arc<Mutex<Subscriber>>)> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.iter().map(|(id, sub)| (*id, Arc::clone(sub))).collect()
        };

        let mut dead = Vec::new();
        for (id, sub) in snapshot {
            if sub.lock().unwrap().flush_pending().is_err() {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.lock().unwrap();
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(PtyMasterError::from)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(PtyMasterError::from)?;
    Ok(())
}

fn exec_shell_or_exit(slave_fd: RawFd, shell: &str) -> ! {
    setsid().ok();
    unsafe {
        libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0);
    }
    let _ = dup2(slave_fd, libc::STDIN_FILENO);
    let _ = dup2(slave_fd, libc::STDOUT_FILENO);
    let _ = dup2(slave_fd, libc::STDERR_FILENO);
    if slave_fd > libc::STDERR_FILENO {
        let _ = unsafe { OwnedFd::from_raw_fd(slave_fd) };
    }

    std::env::set_var("TERM", "xterm-256color");
    std::env::set_var("PS1", r"\u@\h:\w\$ ");

    let shell_cstr = match CString::new(shell) {
        Ok(s) => s,
        Err(_) => std::process::exit(127),
    };
    let login_flag = CString::new("-l").unwrap();
    let args = [shell_cstr.clone(), login_flag];
    let err = execvp(&shell_cstr, &args).unwrap_err();
    eprintln!("ptymaster: failed to exec {shell}: {err}");
    std::process::exit(126);
}

fn spawn_reader(session: Arc<Session>) -> JoinHandle<()> {
    let running = Arc::clone(&session.running);
    thread::spawn(move || {
        let master_fd = session.master.as_raw_fd();
        let mut buf = [0u8; READ_CHUNK];
        // Only set when the loop breaks because the child itself is gone
        // (EOF, POLLHUP/POLLERR, a poll/read error); `close()` clearing
        // `running` is a request to stop, not evidence the child exited,
        // and must not mark the session dead (that would make `close()`'s
        // own SIGTERM/SIGKILL block below it always skip itself).
        let mut child_dead = false;
        while running.load(Ordering::SeqCst) {
            let fd = unsafe { BorrowedFd::borrow_raw(master_fd) };
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(0) => {
                    session.flush_subscribers();
                    continue;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    warn!(session = %session.id, error = %err, "poll failed");
                    child_dead = true;
                    break;
                }
                Ok(_) => {}
            }

            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.contains(PollFlags::POLLIN) {
                match unistd::read(master_fd, &mut buf) {
                    Ok(0) => {
                        child_dead = true;
                        break;
                    }
                    Ok(n) => session.broadcast(&buf[..n]),
                    Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {}
                    Err(_) => {
                        child_dead = true;
                        break;
                    }
                }
            } else if revents.contains(PollFlags::POLLHUP) || revents.contains(PollFlags::POLLERR) {
                child_dead = true;
                break;
            }
        }
        if child_dead {
            session.mark_exited();
            reap_child_nonblocking(session.child_pid);
            info!(session = %session.id, "reader thread exiting, child has exited");
        } else {
            debug!(session = %session.id, "reader thread exiting, close() requested");
        }
    })
}

fn reap_child_nonblocking(pid: Pid) {
    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
}

//! The daemon: binds the endpoint socket, accepts connections forever, and
//! dispatches each to a per-client worker thread. Sessions are created
//! lazily on first `connect` and kept in a single mutex-guarded registry.

use std::collections::HashMap;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tracing::{error, info, warn};

use crate::error::{PtyMasterError, Result};
use crate::protocol::{ControlFrame, MAX_FRAME_BYTES};
use crate::session::{Session, DEFAULT_COLS, DEFAULT_ROWS};

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/ptymaster.sock";
const LISTEN_BACKLOG: i32 = 5;

struct Registry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the named session, creating it (and its shell) if this is
    /// the first `connect` for that id, and pruning it first if its child
    /// has already exited.
    fn get_or_create(&self, id: &str, shell: &str) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(id) {
            if existing.is_alive() {
                return Ok(Arc::clone(existing));
            }
            sessions.remove(id);
        }
        let session = Session::open(id, shell, DEFAULT_ROWS, DEFAULT_COLS)?;
        sessions.insert(id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    fn close_all(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for (_, session) in sessions.drain() {
            session.close();
        }
    }
}

pub struct Daemon {
    endpoint: PathBuf,
    shell: String,
    registry: Arc<Registry>,
    shutting_down: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(endpoint: impl Into<PathBuf>, shell: impl Into<String>) -> Self {
        Daemon {
            endpoint: endpoint.into(),
            shell: shell.into(),
            registry: Arc::new(Registry::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Binds the endpoint and accepts connections until `stop()` is called
    /// from another thread (typically a signal handler).
    pub fn start(&self) -> Result<()> {
        let listener = bind_endpoint(&self.endpoint)?;
        info!(socket = %self.endpoint.display(), "daemon listening");

        for incoming in listener.incoming() {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            match incoming {
                Ok(stream) => {
                    let registry = Arc::clone(&self.registry);
                    let shell = self.shell.clone();
                    thread::spawn(move || {
                        if let Err(err) = handle_client(stream, &registry, &shell) {
                            warn!(error = %err, "client handler exited with error");
                        }
                    });
                }
                Err(err) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    error!(error = %err, "accept failed");
                }
            }
        }

        self.registry.close_all();
        let _ = std::fs::remove_file(&self.endpoint);
        info!("daemon stopped");
        Ok(())
    }

    /// Signals `start()`'s accept loop to stop and closes every session.
    /// Safe to call from a signal handler thread.
    pub fn stop(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        // Unblock `accept()` by connecting to our own socket once.
        let _ = UnixStream::connect(&self.endpoint);
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            shutting_down: Arc::clone(&self.shutting_down),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// A cheaply cloneable handle that can request shutdown without holding a
/// reference to the `Daemon` itself; used by the signal handler closure.
#[derive(Clone)]
pub struct DaemonHandle {
    shutting_down: Arc<AtomicBool>,
    endpoint: PathBuf,
}

impl DaemonHandle {
    pub fn stop(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = UnixStream::connect(&self.endpoint);
    }
}

/// Binds and listens with an explicit backlog — `UnixListener::bind` alone
/// only offers std's default (128), and the control protocol's accept queue
/// is specified to be `LISTEN_BACKLOG` deep.
fn bind_endpoint(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    // CLOEXEC so a forked shell child doesn't inherit the listening fd.
    let sock_fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    socket::bind(sock_fd.as_raw_fd(), &addr).map_err(|err| {
        if err == nix::errno::Errno::EADDRINUSE {
            PtyMasterError::EndpointBusy
        } else {
            PtyMasterError::from(err)
        }
    })?;
    socket::listen(&sock_fd, Backlog::new(LISTEN_BACKLOG)?)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(UnixListener::from(sock_fd))
}

/// One worker per accepted connection: enter control mode for the initial
/// handshake, then loop mode for everything after.
fn handle_client(mut stream: UnixStream, registry: &Registry, shell: &str) -> Result<()> {
    let mut buf = [0u8; MAX_FRAME_BYTES];

    // --- Control mode: the first message must be `connect`. ---
    let n = stream.read(&mut buf)?;
    if n == 0 {
        return Ok(());
    }
    let session_id = match ControlFrame::decode(&buf[..n]) {
        Ok(ControlFrame::Connect { session_id }) => session_id,
        _ => {
            warn!("client's first message was not a connect frame; closing");
            return Err(PtyMasterError::BadControlFrame);
        }
    };

    let session = registry.get_or_create(&session_id, shell)?;
    let subscriber_stream = stream.try_clone()?;
    // `Session::attach` puts its copy of this socket in non-blocking mode
    // so broadcasts never stall on a slow subscriber. Because `try_clone`
    // shares the same underlying open file description, that flag is
    // visible on `stream` too from this point on — the loop-mode read
    // below has to tolerate `WouldBlock` rather than assume a plain
    // blocking read.
    let subscriber_id = session.attach(subscriber_stream)?;

    let reply = ControlFrame::connected(session_id.clone()).encode()?;
    use std::io::Write;
    stream.write_all(&reply)?;

    info!(session = %session_id, "client connected");

    // --- Loop mode: control frames or raw bytes, both forwarded to the PTY. ---
    let result = read_loop(&mut stream, &mut buf, &session, &session_id);

    session.detach(subscriber_id);
    info!(session = %session_id, "client disconnected");
    result
}

fn read_loop(
    stream: &mut UnixStream,
    buf: &mut [u8],
    session: &Session,
    session_id: &str,
) -> Result<()> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::{AsRawFd, BorrowedFd};

    loop {
        let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(200u16)) {
            Ok(0) => continue, // timeout, check again
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => return Err(PtyMasterError::from(err)),
        }

        match stream.read(buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                let chunk = &buf[..n];
                match ControlFrame::try_decode(chunk) {
                    Some(ControlFrame::Resize { rows, cols }) => {
                        if let Err(err) = session.resize(rows, cols) {
                            warn!(session = %session_id, error = %err, "resize failed");
                        }
                    }
                    Some(ControlFrame::Input { data }) => {
                        if let Err(err) = session.write(data.as_bytes()) {
                            warn!(session = %session_id, error = %err, "write failed");
                        }
                    }
                    Some(_) | None => {
                        // Not a control frame (or an unexpected one): treat
                        // as raw bytes bound for the PTY, per §4.2 step 4.
                        if let Err(err) = session.write(chunk) {
                            warn!(session = %session_id, error = %err, "write failed");
                        }
                    }
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(PtyMasterError::Io(err)),
        }
    }
}

use std::io;
use thiserror::Error;

/// Errors produced anywhere in the PTY multiplexer: session lifecycle, the
/// control protocol codec, and the daemon's socket handling.
#[derive(Error, Debug)]
pub enum PtyMasterError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("the endpoint socket is already in use")]
    EndpointBusy,

    #[error("failed to allocate a pseudo-terminal")]
    PtyAllocFailed,

    #[error("failed to fork the child shell process")]
    ForkFailed,

    #[error("failed to exec the shell: {0}")]
    ExecFailed(String),

    #[error("subscriber connection is broken")]
    SubscriberBroken,

    #[error("received a malformed control frame")]
    BadControlFrame,

    #[error("the session's child process has exited")]
    ChildExited,

    #[error("no session found with id '{0}'")]
    SessionNotFound(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("client handshake failed: {0}")]
    HandshakeFailed(String),
}

pub type Result<T> = std::result::Result<T, PtyMasterError>;

impl From<nix::Error> for PtyMasterError {
    fn from(err: nix::Error) -> Self {
        match err {
            nix::Error::EPERM => PtyMasterError::PermissionDenied,
            other => PtyMasterError::Io(io::Error::from(other)),
        }
    }
}

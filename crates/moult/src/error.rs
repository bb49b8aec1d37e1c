//! Error types for the restart lifecycle.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by [`PollableListener::accept`](crate::PollableListener::accept).
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener has been gracefully closed; no further connections will be accepted.
    #[error("listener has been gracefully closed")]
    Closed,

    /// The underlying accept failed.
    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

impl AcceptError {
    /// Whether this is the graceful-close error rather than an I/O failure.
    pub fn is_closed(&self) -> bool {
        matches!(self, AcceptError::Closed)
    }
}

/// Errors that end a [`DrainingServer`](crate::DrainingServer) accept loop.
#[derive(Debug, Error)]
pub enum ServeError {
    /// A non-transient accept error. Already dispatched connections were drained.
    #[error("accept loop failed: {0}")]
    Accept(#[source] io::Error),
}

/// Errors from the socket handoff collaborator.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The inherited environment is inconsistent. This is a bug in the predecessor.
    #[error("inconsistent listener inheritance: {0}")]
    Inconsistent(String),

    /// An inherited descriptor is not a socket.
    #[error("inherited fd {fd} (name: {name}) is not a valid socket")]
    NotASocket { fd: RawFd, name: String },

    /// An inherited descriptor could not be adopted.
    #[error("failed to adopt inherited fd {fd}: {source}")]
    Adopt { fd: RawFd, source: io::Error },

    /// Signalling the predecessor process failed.
    #[error("failed to signal predecessor pid {pid}: {source}")]
    Notify { pid: i32, source: io::Error },

    /// Descriptors or the exec environment could not be prepared.
    #[error("failed to prepare process replacement: {0}")]
    Prepare(#[source] io::Error),

    /// `execve` returned.
    #[error("execve of {} failed: {source}", .exe.display())]
    Exec { exe: PathBuf, source: io::Error },
}

/// Errors from an [`EventSource`](crate::EventSource).
#[derive(Debug, Error)]
pub enum EventError {
    /// A signal handler could not be installed.
    #[error("failed to register signal handler: {0}")]
    Register(#[from] io::Error),

    /// The source will never deliver another event.
    #[error("event source closed")]
    Closed,
}

/// Invalid configuration value.
#[derive(Debug, Error)]
#[error("invalid {var}={value:?}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// Fatal errors from the [`Orchestrator`](crate::Orchestrator). Each maps to a
/// non-zero process exit status.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No socket was inherited and binding a fresh one failed.
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    /// Inherited descriptors were present but unusable.
    #[error("failed to inherit listener: {0}")]
    Inherit(#[source] HandoffError),

    /// The acquired socket could not be prepared for serving.
    #[error("failed to prepare listening socket: {0}")]
    Socket(#[source] io::Error),

    /// The accept loop died on its own.
    #[error("server stopped: {0}")]
    Serve(#[from] ServeError),

    /// The accept loop returned although nothing closed the listener.
    #[error("server stopped without a close request")]
    UnexpectedStop,

    /// The accept loop task panicked or was cancelled.
    #[error("server task failed: {0}")]
    ServerTask(#[from] tokio::task::JoinError),

    /// Events could no longer be awaited.
    #[error("event source failed: {0}")]
    Events(#[from] EventError),

    /// Exec of the replacement failed after draining; serving cannot resume.
    #[error("process replacement failed: {0}")]
    Replace(#[source] HandoffError),
}

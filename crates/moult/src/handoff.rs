//! Socket handoff between a process and its replacement.

use std::convert::Infallible;
use std::io;
use std::net::TcpListener;
use std::process::Child;

use tracing::{debug, info, warn};

use crate::config::RestartConfig;
use crate::error::HandoffError;
use crate::inherit::ListenerSet;
use crate::restart::{restart, spawn_successor, PREDECESSOR_PID};

/// Acquires, announces and passes on the listening socket.
pub trait Handoff {
    /// The socket handed over by a predecessor, or `None` on a cold start.
    fn try_inherit(&mut self) -> Result<Option<TcpListener>, HandoffError>;

    /// Tell the predecessor that this process now owns the socket. Only called
    /// after a successful [`try_inherit`](Self::try_inherit).
    fn notify_predecessor(&mut self) -> Result<(), HandoffError>;

    /// Replace this process image with a successor that inherits `socket`.
    /// Never returns on success.
    fn replace_process_image(&mut self, socket: TcpListener) -> Result<Infallible, HandoffError>;

    /// Start a successor that inherits `socket` while this process keeps
    /// serving. Returns the successor's pid. The successor is expected to call
    /// [`notify_predecessor`](Self::notify_predecessor), which ends this
    /// process's serving phase.
    fn spawn_successor(&mut self, socket: &TcpListener) -> Result<u32, HandoffError>;
}

/// [`Handoff`] over `LISTEN_FDS` fd inheritance, with the successor either
/// exec'd in place or spawned as a child.
#[derive(Debug)]
pub struct FdHandoff {
    name: String,
    predecessor: Option<i32>,
}

impl FdHandoff {
    /// Hand off a single listener called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predecessor: None,
        }
    }

    pub fn from_config(config: &RestartConfig) -> Self {
        Self::new(config.listener_name.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Handoff for FdHandoff {
    fn try_inherit(&mut self) -> Result<Option<TcpListener>, HandoffError> {
        let Some(mut set) = ListenerSet::from_env()? else {
            return Ok(None);
        };

        let listener = set.take(&self.name)?;
        set.ensure_empty()?;

        self.predecessor = std::env::var(PREDECESSOR_PID)
            .ok()
            .and_then(|raw| raw.trim().parse().ok());

        Ok(Some(listener))
    }

    fn notify_predecessor(&mut self) -> Result<(), HandoffError> {
        let Some(pid) = self.predecessor.take() else {
            debug!("No predecessor pid recorded, nothing to notify");
            return Ok(());
        };

        if i64::from(pid) == i64::from(std::process::id()) {
            debug!(pid, "Predecessor replaced itself in place, nothing to notify");
            return Ok(());
        }

        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(pid, libc::SIGQUIT) } != 0 {
            let source = io::Error::last_os_error();
            warn!(pid, error = %source, "Failed to signal predecessor");
            return Err(HandoffError::Notify { pid, source });
        }

        info!(pid, "Signalled predecessor to drain and exit");
        Ok(())
    }

    fn replace_process_image(&mut self, socket: TcpListener) -> Result<Infallible, HandoffError> {
        restart(&[(self.name.as_str(), &socket)])
    }

    fn spawn_successor(&mut self, socket: &TcpListener) -> Result<u32, HandoffError> {
        let child = spawn_successor(&[(self.name.as_str(), socket)])?;
        let pid = child.id();
        reap_in_background(child);
        Ok(pid)
    }
}

/// Wait for the successor on a plain thread so it never lingers as a zombie.
/// A successor normally outlives this process, so any exit seen here is early.
fn reap_in_background(mut child: Child) {
    let pid = child.id();
    let reaper = std::thread::Builder::new()
        .name(format!("moult-reap-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => warn!(pid, status = %status, "Successor exited"),
            Err(e) => warn!(pid, error = %e, "Failed to wait for successor"),
        });

    if let Err(e) = reaper {
        warn!(pid, error = %e, "Could not start successor reaper thread");
    }
}

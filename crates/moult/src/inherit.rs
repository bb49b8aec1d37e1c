//! Listener inheritance from file descriptors.
//!
//! Checks `LISTEN_FDS` and `LISTEN_FD_NAMES` environment variables
//! (compatible with systemd socket activation fd passing).
//! Fails hard if the env says fds exist but they're invalid.

use std::env;
use std::net::TcpListener;
use std::os::unix::io::{FromRawFd, RawFd};

use tracing::info;

use crate::error::HandoffError;

pub(crate) const LISTEN_FDS: &str = "LISTEN_FDS";
pub(crate) const LISTEN_FD_NAMES: &str = "LISTEN_FD_NAMES";
pub(crate) const FIRST_INHERITED_FD: RawFd = 3;

/// A set of named listeners inherited from the predecessor process via fd passing.
#[derive(Debug)]
pub struct ListenerSet {
    listeners: Vec<(String, TcpListener)>,
}

impl ListenerSet {
    /// Create a listener set from inherited file descriptors.
    ///
    /// Reads `LISTEN_FDS` and `LISTEN_FD_NAMES` from the environment.
    /// Returns `Ok(None)` if `LISTEN_FDS` is absent or "0" (cold start).
    /// A half-inherited state is a bug in the predecessor and is an error.
    pub fn from_env() -> Result<Option<Self>, HandoffError> {
        let names = parse_listen_env(
            env::var(LISTEN_FDS).ok().as_deref(),
            env::var(LISTEN_FD_NAMES).ok().as_deref(),
        )?;

        if names.is_empty() {
            return Ok(None);
        }

        let mut listeners = Vec::with_capacity(names.len());
        for (offset, name) in names.into_iter().enumerate() {
            let fd = FIRST_INHERITED_FD + offset as RawFd;

            if !is_socket(fd) {
                return Err(HandoffError::NotASocket { fd, name });
            }

            // SAFETY: fstat reports a socket at this fd and the predecessor handed
            // it to us; nothing else in this process owns it.
            let listener = unsafe { TcpListener::from_raw_fd(fd) };
            let addr = listener
                .local_addr()
                .map_err(|source| HandoffError::Adopt { fd, source })?;

            info!(fd, name = %name, addr = %addr, "Inherited listener from predecessor process");
            listeners.push((name, listener));
        }

        // The variables stay set: mutating the environment is unsound once other
        // threads run, and every handoff path sets them explicitly for the child.
        Ok(Some(Self { listeners }))
    }

    /// Take a listener by name, removing it from the set.
    pub fn take(&mut self, name: &str) -> Result<TcpListener, HandoffError> {
        let Some(pos) = self.listeners.iter().position(|(n, _)| n == name) else {
            return Err(HandoffError::Inconsistent(format!(
                "expected inherited listener '{}' but only have {:?}",
                name,
                self.names()
            )));
        };
        Ok(self.listeners.remove(pos).1)
    }

    /// Check that all listeners have been consumed.
    ///
    /// Catches mismatches between what the predecessor passed and what this
    /// binary expects.
    pub fn ensure_empty(self) -> Result<(), HandoffError> {
        if self.listeners.is_empty() {
            return Ok(());
        }
        Err(HandoffError::Inconsistent(format!(
            "unconsumed inherited listeners: {:?}",
            self.names()
        )))
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn names(&self) -> Vec<&str> {
        self.listeners.iter().map(|(n, _)| n.as_str()).collect()
    }
}

/// Validate `LISTEN_FDS` / `LISTEN_FD_NAMES` and return the names in fd order.
///
/// An empty result means cold start.
fn parse_listen_env(
    listen_fds: Option<&str>,
    fd_names: Option<&str>,
) -> Result<Vec<String>, HandoffError> {
    let count: usize = match listen_fds.map(str::trim) {
        None | Some("") | Some("0") => return Ok(Vec::new()),
        Some(raw) => raw.parse().map_err(|_| {
            HandoffError::Inconsistent(format!("{LISTEN_FDS}={raw:?} is not a count"))
        })?,
    };

    let names_raw = fd_names.ok_or_else(|| {
        HandoffError::Inconsistent(format!("{LISTEN_FDS} is set but {LISTEN_FD_NAMES} is missing"))
    })?;

    let names: Vec<String> = names_raw.split(':').map(str::to_string).collect();
    if names.len() != count {
        return Err(HandoffError::Inconsistent(format!(
            "{LISTEN_FD_NAMES} has {} entries but {LISTEN_FDS} says {}",
            names.len(),
            count
        )));
    }

    Ok(names)
}

/// Validate that a file descriptor is a valid socket using fstat.
pub(crate) fn is_socket(fd: RawFd) -> bool {
    // SAFETY: an all-zero `stat` is a valid value and fstat only writes into it.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fstat on an arbitrary fd is sound; invalid fds fail with EBADF.
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

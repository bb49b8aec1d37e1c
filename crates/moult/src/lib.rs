//! # moult
//!
//! Graceful restart of a long-running TCP listener with zero refused connections.
//!
//! ## Overview
//!
//! A restart is a strict sequence:
//! 1. Acquire a listening socket, inherited from a predecessor process via fd
//!    inheritance or bound fresh
//! 2. Serve connections on it until an operator event arrives
//! 3. Stop accepting, then drain every in-flight connection
//! 4. Exit, or exec a replacement that inherits the still-open socket
//!
//! Sockets that arrive while the old process drains wait in the kernel backlog and
//! are accepted by the replacement.
//!
//! ## Signal Conventions
//!
//! - `SIGINT`, `SIGTERM`, `SIGQUIT` — drain, then exit
//! - `SIGUSR2` — drain, then exec the current binary with the socket handed over.
//!   With [`HandoffStrategy::Spawn`] the binary is started as a child instead and
//!   this process keeps serving until the child sends it `SIGQUIT`.
//!
//! ## Environment Variables
//!
//! - `LISTEN_FDS` — Number of inherited file descriptors (starting at fd 3)
//! - `LISTEN_FD_NAMES` — Colon-separated names for each inherited fd
//! - `MOULT_PREDECESSOR_PID` — Pid of the process that handed the socket over
//! - `MOULT_ADDR`, `MOULT_LISTENER_NAME`, `MOULT_DRAIN_TIMEOUT_SECS`,
//!   `MOULT_HANDOFF_STRATEGY` — see [`RestartConfig`]
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("moult requires a Unix platform (Linux or macOS)");

mod config;
mod error;
mod events;
mod handoff;
mod inherit;
mod orchestrator;
mod pollable;
mod restart;
mod server;

pub use config::{HandoffStrategy, RestartConfig};
pub use error::{
    AcceptError, ConfigError, EventError, HandoffError, OrchestratorError, ServeError,
};
pub use events::{Decision, EventKind, EventSource, SignalEvents};
pub use handoff::{FdHandoff, Handoff};
pub use inherit::ListenerSet;
pub use orchestrator::{Orchestrator, Phase, ProcessIdentity, Shutdown};
pub use pollable::{CloseHandle, PollableListener};
pub use restart::{restart, spawn_successor};
pub use server::{ConnectionGuard, ConnectionHandler, DrainSignal, DrainingServer};

//! External events that end the serving phase.
//!
//! Signals are delivered through [`SignalEvents`]; anything else (tests, an
//! embedding supervisor) can drive the lifecycle through an
//! `mpsc::Receiver<EventKind>`.

use std::fmt;
use std::future::Future;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::EventError;

/// Kind of event received from the operator or the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// SIGINT
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGQUIT, also sent by a replacement to its predecessor.
    Quit,
    /// SIGUSR2: hand the socket to a fresh copy of this binary.
    Upgrade,
}

impl EventKind {
    /// What the orchestrator does after draining.
    pub fn decision(self) -> Decision {
        match self {
            EventKind::Interrupt | EventKind::Terminate | EventKind::Quit => Decision::Terminate,
            EventKind::Upgrade => Decision::Replace,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Interrupt => write!(f, "SIGINT"),
            EventKind::Terminate => write!(f, "SIGTERM"),
            EventKind::Quit => write!(f, "SIGQUIT"),
            EventKind::Upgrade => write!(f, "SIGUSR2"),
        }
    }
}

/// Restart decision derived from an [`EventKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Drain, then exit successfully.
    Terminate,
    /// Drain, then exec a replacement that inherits the socket.
    Replace,
}

/// Source of lifecycle events.
pub trait EventSource {
    /// Wait for the next event.
    fn next_event(&mut self) -> impl Future<Output = Result<EventKind, EventError>> + Send;
}

/// Unix signal handlers for SIGINT, SIGTERM, SIGQUIT and SIGUSR2.
#[derive(Debug)]
pub struct SignalEvents {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
    upgrade: Signal,
}

impl SignalEvents {
    /// Install the signal handlers. Must be called from within a tokio runtime.
    pub fn register() -> Result<Self, EventError> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            upgrade: signal(SignalKind::user_defined2())?,
        })
    }
}

impl EventSource for SignalEvents {
    async fn next_event(&mut self) -> Result<EventKind, EventError> {
        let received = tokio::select! {
            r = self.interrupt.recv() => r.map(|()| EventKind::Interrupt),
            r = self.terminate.recv() => r.map(|()| EventKind::Terminate),
            r = self.quit.recv() => r.map(|()| EventKind::Quit),
            r = self.upgrade.recv() => r.map(|()| EventKind::Upgrade),
        };

        let kind = received.ok_or(EventError::Closed)?;
        info!(signal = %kind, decision = ?kind.decision(), "Received signal");
        Ok(kind)
    }
}

impl EventSource for mpsc::Receiver<EventKind> {
    async fn next_event(&mut self) -> Result<EventKind, EventError> {
        self.recv().await.ok_or(EventError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_decision_mapping() {
        assert_eq!(EventKind::Interrupt.decision(), Decision::Terminate);
        assert_eq!(EventKind::Terminate.decision(), Decision::Terminate);
        assert_eq!(EventKind::Quit.decision(), Decision::Terminate);
        assert_eq!(EventKind::Upgrade.decision(), Decision::Replace);
    }

    #[tokio::test]
    async fn test_channel_source_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(EventKind::Upgrade).await.unwrap();
        tx.send(EventKind::Quit).await.unwrap();

        assert_eq!(rx.next_event().await.unwrap(), EventKind::Upgrade);
        assert_eq!(rx.next_event().await.unwrap(), EventKind::Quit);
    }

    #[tokio::test]
    async fn test_closed_channel_is_an_error() {
        let (tx, mut rx) = mpsc::channel::<EventKind>(1);
        drop(tx);

        assert!(matches!(rx.next_event().await, Err(EventError::Closed)));
    }

    #[tokio::test]
    async fn test_sigusr2_maps_to_upgrade() {
        let mut events = SignalEvents::register().unwrap();

        // SAFETY: raise has no memory-safety preconditions; the handler is installed.
        let rc = unsafe { libc::raise(libc::SIGUSR2) };
        assert_eq!(rc, 0);

        let kind = tokio::time::timeout(Duration::from_secs(2), events.next_event())
            .await
            .expect("signal was not delivered")
            .unwrap();
        assert_eq!(kind, EventKind::Upgrade);
        assert_eq!(kind.decision(), Decision::Replace);
    }
}

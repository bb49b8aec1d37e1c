//! Shared helpers for lifecycle integration tests.

#![allow(dead_code)]

use std::convert::Infallible;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use moult::{Handoff, HandoffError, Phase, ProcessIdentity};
use tokio::sync::watch;

/// Initialize test logging once.
pub fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// What a [`FakeHandoff`] observed.
#[derive(Debug, Default)]
pub struct HandoffLog {
    pub inherit_calls: AtomicUsize,
    pub notify_calls: AtomicUsize,
    pub replace_calls: AtomicUsize,
    pub spawn_calls: AtomicUsize,
    /// Whether a client could still connect to the socket passed to replace.
    pub socket_open_at_replace: Mutex<Option<bool>>,
}

impl HandoffLog {
    pub fn notify_calls(&self) -> usize {
        self.notify_calls.load(Ordering::SeqCst)
    }

    pub fn replace_calls(&self) -> usize {
        self.replace_calls.load(Ordering::SeqCst)
    }

    pub fn spawn_calls(&self) -> usize {
        self.spawn_calls.load(Ordering::SeqCst)
    }
}

/// In-memory [`Handoff`]: optionally "inherits" a pre-bound socket, records
/// notifications, and fails every replacement the way a missing binary would.
/// Spawns succeed with a made-up pid unless built with [`failing_spawn`](Self::failing_spawn).
pub struct FakeHandoff {
    inherited: Option<TcpListener>,
    spawn_fails: bool,
    pub log: Arc<HandoffLog>,
}

impl FakeHandoff {
    pub fn cold() -> Self {
        Self {
            inherited: None,
            spawn_fails: false,
            log: Arc::default(),
        }
    }

    pub fn inheriting(socket: TcpListener) -> Self {
        Self {
            inherited: Some(socket),
            spawn_fails: false,
            log: Arc::default(),
        }
    }

    pub fn failing_spawn(mut self) -> Self {
        self.spawn_fails = true;
        self
    }
}

impl Handoff for FakeHandoff {
    fn try_inherit(&mut self) -> Result<Option<TcpListener>, HandoffError> {
        self.log.inherit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.inherited.take())
    }

    fn notify_predecessor(&mut self) -> Result<(), HandoffError> {
        self.log.notify_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn replace_process_image(&mut self, socket: TcpListener) -> Result<Infallible, HandoffError> {
        self.log.replace_calls.fetch_add(1, Ordering::SeqCst);

        let open = socket
            .local_addr()
            .and_then(|addr| std::net::TcpStream::connect_timeout(&addr, Duration::from_secs(1)))
            .is_ok();
        *self.log.socket_open_at_replace.lock().unwrap() = Some(open);

        Err(HandoffError::Exec {
            exe: "/nonexistent/moult-replacement".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        })
    }

    fn spawn_successor(&mut self, socket: &TcpListener) -> Result<u32, HandoffError> {
        self.log.spawn_calls.fetch_add(1, Ordering::SeqCst);
        socket.local_addr().map_err(HandoffError::Prepare)?;

        if self.spawn_fails {
            return Err(HandoffError::Exec {
                exe: "/nonexistent/moult-successor".into(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        Ok(4242)
    }
}

/// Wait until the orchestrator is serving and return where.
pub async fn wait_for_serving(phases: &mut watch::Receiver<Phase>) -> (SocketAddr, ProcessIdentity) {
    let phase = tokio::time::timeout(
        Duration::from_secs(5),
        phases.wait_for(|p| matches!(p, Phase::Serving { .. })),
    )
    .await
    .expect("orchestrator never started serving")
    .expect("orchestrator dropped before serving");

    match *phase {
        Phase::Serving { addr, identity } => (addr, identity),
        _ => unreachable!(),
    }
}

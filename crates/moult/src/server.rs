//! Accept loop with connection draining.
//!
//! Every accepted connection runs in its own task and holds a
//! [`ConnectionGuard`]. [`DrainingServer::serve`] returns only once the
//! listener is closed and every guard has dropped.

use std::any::Any;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{AcceptError, ServeError};
use crate::pollable::PollableListener;

/// Handles one connection to completion.
///
/// Implemented for any `Fn(TcpStream, SocketAddr) -> impl Future<Output = ()>`.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, stream: TcpStream, peer: SocketAddr) -> impl Future<Output = ()> + Send;
}

impl<F, Fut> ConnectionHandler for F
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    fn handle(&self, stream: TcpStream, peer: SocketAddr) -> impl Future<Output = ()> + Send {
        self(stream, peer)
    }
}

/// Tracks one in-flight connection.
///
/// The server waits for all `ConnectionGuard`s to drop before
/// considering drain complete.
#[derive(Clone)]
pub struct ConnectionGuard {
    _drop_notifier: Arc<DropNotifier>,
}

struct DropNotifier {
    counter: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for DropNotifier {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// Fires once a [`DrainingServer`] has stopped accepting and every
/// dispatched connection has finished.
#[derive(Debug, Clone)]
pub struct DrainSignal {
    drained: CancellationToken,
}

impl DrainSignal {
    pub async fn wait(&self) {
        self.drained.cancelled().await;
    }

    pub fn is_drained(&self) -> bool {
        self.drained.is_cancelled()
    }
}

/// Runs the accept loop and knows when all work has stopped.
///
/// Clones share the same connection set and drain signal.
#[derive(Clone)]
pub struct DrainingServer {
    /// Active connection counter.
    connection_count: Arc<AtomicUsize>,

    /// Notified when the last connection drains.
    drain_notify: Arc<Notify>,

    /// Cancelled after the drain barrier is satisfied.
    drained: CancellationToken,
}

impl Default for DrainingServer {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainingServer {
    pub fn new() -> Self {
        Self {
            connection_count: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
            drained: CancellationToken::new(),
        }
    }

    /// Create a `ConnectionGuard` for a new connection.
    ///
    /// Increments the counter on creation, decrements on drop.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            _drop_notifier: Arc::new(DropNotifier {
                counter: Arc::clone(&self.connection_count),
                notify: Arc::clone(&self.drain_notify),
            }),
        }
    }

    /// Get the current number of active connections.
    pub fn active_connections(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    pub fn drained(&self) -> DrainSignal {
        DrainSignal {
            drained: self.drained.clone(),
        }
    }

    /// Accept and dispatch connections until the listener is closed, then wait
    /// for every dispatched connection to finish.
    ///
    /// A handler panic is logged and contained to its own connection. A
    /// non-transient accept error ends the loop; connections already dispatched
    /// are still drained before the error is returned.
    pub async fn serve<H>(&self, listener: PollableListener, handler: H) -> Result<(), ServeError>
    where
        H: ConnectionHandler,
    {
        let handler = Arc::new(handler);
        let addr = listener.local_addr().ok();
        info!(addr = ?addr, "Accept loop started");

        let result = loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let guard = self.connection_guard();
                    debug!(
                        peer = %peer,
                        active_connections = self.active_connections(),
                        "Accepted connection"
                    );
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let _guard = guard;
                        let handled = AssertUnwindSafe(handler.handle(stream, peer))
                            .catch_unwind()
                            .await;
                        match handled {
                            Ok(()) => debug!(peer = %peer, "Connection finished"),
                            Err(panic) => error!(
                                peer = %peer,
                                panic = %panic_message(panic.as_ref()),
                                "Connection handler panicked"
                            ),
                        }
                    });
                }
                Err(AcceptError::Closed) => {
                    info!(addr = ?addr, "Listener closed, accept loop stopped");
                    break Ok(());
                }
                Err(AcceptError::Io(e)) if is_connection_error(&e) => {
                    debug!(error = %e, "Transient accept error, continuing");
                }
                Err(AcceptError::Io(e)) => {
                    error!(error = %e, addr = ?addr, "Accept failed, accept loop stopped");
                    break Err(ServeError::Accept(e));
                }
            }
        };

        // The caller keeps its own handle on the socket; ours is released here.
        drop(listener);

        let active = self.active_connections();
        if active > 0 {
            info!(active_connections = active, "Draining active connections");
        }
        self.wait_for_drain().await;
        info!("All connections drained");
        self.drained.cancel();

        result
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.drain_notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent last drop is not missed.
            notified.as_mut().enable();
            if self.connection_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Errors that concern a single connection attempt, not the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

//! Listener decorator with prompt, graceful close.
//!
//! A plain `accept()` waits until a client shows up. [`PollableListener`] races
//! every accept against a close notification, so a close request is observed
//! by a pending accept immediately instead of after the next connection.
//!
//! Closing the decorator never closes the OS socket. Whether the socket is
//! closed or handed to a replacement process is decided by whoever owns it.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AcceptError;

/// A TCP listener whose accept loop can be stopped from another task.
#[derive(Debug)]
pub struct PollableListener {
    inner: TcpListener,
    closed: CancellationToken,
}

/// Cloneable handle that closes a [`PollableListener`] owned elsewhere.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    closed: CancellationToken,
}

impl CloseHandle {
    /// Stop accepting. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!("Closing listener");
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the listener has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl PollableListener {
    pub fn new(inner: TcpListener) -> Self {
        Self {
            inner,
            closed: CancellationToken::new(),
        }
    }

    /// Wrap a std listener. Must be called from within a tokio runtime.
    pub fn from_std(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self::new(TcpListener::from_std(listener)?))
    }

    /// Accept the next connection.
    ///
    /// Fails with [`AcceptError::Closed`] once [`close`](Self::close) has been
    /// called, including for an accept that was already pending. When a close and
    /// a connection race, the close wins and the connection stays queued in the
    /// kernel backlog.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), AcceptError> {
        if self.closed.is_cancelled() {
            return Err(AcceptError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(AcceptError::Closed),
            accepted = self.inner.accept() => accepted.map_err(AcceptError::Io),
        }
    }

    /// Stop accepting. Idempotent; the OS socket stays open.
    pub fn close(&self) {
        self.close_handle().close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the listener has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            closed: self.closed.clone(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Give back the underlying listener.
    pub fn into_inner(self) -> TcpListener {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    async fn bind_local() -> PollableListener {
        PollableListener::new(TcpListener::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn test_accepts_connections_while_open() {
        let listener = bind_local().await;
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_stream, peer) = listener.accept().await.unwrap();
        let client = client.await.unwrap();

        assert_eq!(peer, client.local_addr().unwrap());
        assert!(!listener.is_closed());
    }

    #[tokio::test]
    async fn test_accept_after_close_fails_immediately() {
        let listener = bind_local().await;
        listener.close();

        let err = listener.accept().await.unwrap_err();
        assert!(err.is_closed());
    }

    /// A pending accept with no incoming connection observes close promptly.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pending_accept_returns_closed_within_interval() {
        let listener = Arc::new(bind_local().await);
        let handle = listener.close_handle();

        let accepting = Arc::clone(&listener);
        let pending = tokio::spawn(async move { accepting.accept().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let closed_at = Instant::now();
        handle.close();

        let result = tokio::time::timeout(Duration::from_millis(100), pending)
            .await
            .expect("accept did not observe close within 100ms")
            .unwrap();
        assert!(matches!(result, Err(AcceptError::Closed)));
        assert!(closed_at.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_double_close_notifies_once() {
        let listener = bind_local().await;
        let handle = listener.close_handle();
        let fired = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let handle = handle.clone();
            let fired = Arc::clone(&fired);
            tokio::spawn(async move {
                handle.closed().await;
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        listener.close();
        handle.close();
        waiter.await.unwrap();

        assert!(handle.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Already-fired notification resolves immediately for late waiters.
        listener.closed().await;
    }

    /// Closing the decorator leaves the OS socket listening.
    #[tokio::test]
    async fn test_close_keeps_socket_open() {
        let listener = bind_local().await;
        let addr = listener.local_addr().unwrap();
        listener.close();

        assert!(TcpStream::connect(addr).await.is_ok());

        let inner = listener.into_inner();
        let (_stream, _) = inner.accept().await.unwrap();
    }
}

//! Restart orchestrator.
//!
//! Owns the listening socket for the life of the process:
//!
//! ```text
//! Acquiring ──► Serving ──► Draining ──┬──► Exiting
//!                                      └──► Replacing
//! ```
//!
//! Every event that ends serving goes through `Draining`, so in-flight
//! connections always finish before the process exits or execs its replacement.
//!
//! With [`HandoffStrategy::Spawn`] an upgrade does not end serving: the successor
//! is started next to this process with the socket, both accept for a moment, and
//! the successor's SIGQUIT then drains and exits this one.
//!
//! The orchestrator keeps its own handle on the socket, separate from the one
//! the accept loop uses. Closing or dropping the accept side never closes the
//! socket at the OS level; connections arriving while draining queue in the
//! kernel backlog for the replacement.

use std::net::{SocketAddr, TcpListener};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{HandoffStrategy, RestartConfig};
use crate::error::{EventError, OrchestratorError, ServeError};
use crate::events::{Decision, EventKind, EventSource};
use crate::handoff::Handoff;
use crate::pollable::{CloseHandle, PollableListener};
use crate::server::{ConnectionHandler, DrainingServer};

/// Whether this process bound its socket or inherited it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessIdentity {
    Original,
    Replacement,
}

/// Observable lifecycle phase, published on [`Orchestrator::phases`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Acquiring,
    Serving {
        addr: SocketAddr,
        identity: ProcessIdentity,
    },
    Draining(Decision),
    Exiting,
    Replacing,
}

/// Outcome of a graceful termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown {
    /// Event that ended serving.
    pub event: EventKind,
    pub identity: ProcessIdentity,
    /// `false` if the drain timeout expired with connections still open.
    pub drained: bool,
}

/// Drives the listener from acquisition to exit or replacement.
pub struct Orchestrator<H, E> {
    config: RestartConfig,
    handoff: H,
    events: E,
    phase: watch::Sender<Phase>,
}

struct Serving {
    identity: ProcessIdentity,
    /// Handle kept for handoff; independent of the accept loop's copy.
    socket: TcpListener,
    close: CloseHandle,
    server: DrainingServer,
    task: JoinHandle<Result<(), ServeError>>,
}

enum State<C> {
    Acquiring(C),
    Serving(Serving),
    Draining(Serving, EventKind),
    Exiting(Shutdown),
    Replacing(TcpListener),
}

enum Wake {
    Event(Result<EventKind, EventError>),
    ServerStopped(Result<Result<(), ServeError>, tokio::task::JoinError>),
}

impl<H, E> Orchestrator<H, E>
where
    H: Handoff + Send,
    E: EventSource + Send,
{
    pub fn new(config: RestartConfig, handoff: H, events: E) -> Self {
        let (phase, _) = watch::channel(Phase::Acquiring);
        Self {
            config,
            handoff,
            events,
            phase,
        }
    }

    /// Subscribe to phase transitions.
    pub fn phases(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Run the lifecycle to completion.
    ///
    /// Returns `Ok` after a graceful termination. A successful replacement never
    /// returns. Every error is fatal: the process should exit with a failure status.
    pub async fn run<C>(mut self, handler: C) -> Result<Shutdown, OrchestratorError>
    where
        C: ConnectionHandler,
    {
        let mut state = State::Acquiring(handler);

        loop {
            state = match state {
                State::Acquiring(handler) => {
                    self.phase.send_replace(Phase::Acquiring);
                    let (socket, identity) = self.acquire()?;
                    State::Serving(self.start_serving(socket, identity, handler)?)
                }
                State::Serving(mut serving) => {
                    let wake = tokio::select! {
                        event = self.events.next_event() => Wake::Event(event),
                        stopped = &mut serving.task => Wake::ServerStopped(stopped),
                    };

                    match wake {
                        Wake::Event(Ok(event))
                            if event.decision() == Decision::Replace
                                && self.config.strategy == HandoffStrategy::Spawn =>
                        {
                            self.spawn_successor(&serving, event);
                            State::Serving(serving)
                        }
                        Wake::Event(Ok(event)) => State::Draining(serving, event),
                        Wake::Event(Err(e)) => {
                            error!(error = %e, "Event source failed, draining before exit");
                            self.drain(&mut serving).await;
                            return Err(e.into());
                        }
                        Wake::ServerStopped(stopped) => {
                            serving.close.close();
                            return Err(match stopped {
                                Ok(Ok(())) => OrchestratorError::UnexpectedStop,
                                Ok(Err(e)) => e.into(),
                                Err(e) => e.into(),
                            });
                        }
                    }
                }
                State::Draining(mut serving, event) => {
                    let decision = event.decision();
                    self.phase.send_replace(Phase::Draining(decision));
                    info!(event = %event, decision = ?decision, "Stopping accept loop");

                    let drained = self.drain(&mut serving).await;
                    match decision {
                        Decision::Terminate => State::Exiting(Shutdown {
                            event,
                            identity: serving.identity,
                            drained,
                        }),
                        Decision::Replace => State::Replacing(serving.socket),
                    }
                }
                State::Exiting(shutdown) => {
                    self.phase.send_replace(Phase::Exiting);
                    info!(
                        event = %shutdown.event,
                        drained = shutdown.drained,
                        "Graceful shutdown complete"
                    );
                    return Ok(shutdown);
                }
                State::Replacing(socket) => {
                    self.phase.send_replace(Phase::Replacing);
                    info!("Handing listener to replacement process");
                    return match self.handoff.replace_process_image(socket) {
                        Ok(never) => match never {},
                        Err(e) => {
                            error!(error = %e, "Process replacement failed, cannot resume serving");
                            Err(OrchestratorError::Replace(e))
                        }
                    };
                }
            };
        }
    }

    fn acquire(&mut self) -> Result<(TcpListener, ProcessIdentity), OrchestratorError> {
        if let Some(socket) = self
            .handoff
            .try_inherit()
            .map_err(OrchestratorError::Inherit)?
        {
            info!(addr = ?socket.local_addr().ok(), "Resuming listening on inherited socket");
            return Ok((socket, ProcessIdentity::Replacement));
        }

        let addr = self.config.addr;
        let socket =
            TcpListener::bind(addr).map_err(|source| OrchestratorError::Bind { addr, source })?;
        info!(addr = ?socket.local_addr().ok(), "Listening on freshly bound socket");
        Ok((socket, ProcessIdentity::Original))
    }

    fn start_serving<C>(
        &mut self,
        socket: TcpListener,
        identity: ProcessIdentity,
        handler: C,
    ) -> Result<Serving, OrchestratorError>
    where
        C: ConnectionHandler,
    {
        socket
            .set_nonblocking(true)
            .map_err(OrchestratorError::Socket)?;
        let addr = socket.local_addr().map_err(OrchestratorError::Socket)?;
        let accept_socket = socket.try_clone().map_err(OrchestratorError::Socket)?;
        let listener = PollableListener::from_std(accept_socket).map_err(OrchestratorError::Socket)?;

        let close = listener.close_handle();
        let server = DrainingServer::new();
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener, handler).await })
        };

        if identity == ProcessIdentity::Replacement {
            if let Err(e) = self.handoff.notify_predecessor() {
                warn!(error = %e, "Could not notify predecessor, continuing to serve");
            }
        }

        info!(addr = %addr, identity = ?identity, "Serving");
        self.phase.send_replace(Phase::Serving { addr, identity });

        Ok(Serving {
            identity,
            socket,
            close,
            server,
            task,
        })
    }

    /// Start a successor on the kept socket. Serving continues either way: on
    /// success until the successor signals, on failure indefinitely.
    fn spawn_successor(&mut self, serving: &Serving, event: EventKind) {
        info!(event = %event, "Starting successor alongside this process");
        match self.handoff.spawn_successor(&serving.socket) {
            Ok(pid) => info!(pid, "Successor started, serving until it takes over"),
            Err(e) => error!(error = %e, "Failed to start successor, continuing to serve"),
        }
    }

    /// Close the listener and wait for the server to drain. Returns `false` if
    /// the configured drain timeout expired first.
    async fn drain(&self, serving: &mut Serving) -> bool {
        serving.close.close();
        info!(
            active_connections = serving.server.active_connections(),
            "Stopped accepting, draining connections"
        );

        let stopped = match self.config.drain_timeout {
            None => (&mut serving.task).await,
            Some(limit) => match tokio::time::timeout(limit, &mut serving.task).await {
                Ok(stopped) => stopped,
                Err(_) => {
                    warn!(
                        remaining_connections = serving.server.active_connections(),
                        timeout_secs = limit.as_secs_f64(),
                        "Drain timeout expired, proceeding with connections still open"
                    );
                    return false;
                }
            },
        };

        match stopped {
            Ok(Ok(())) => info!("Drain complete"),
            Ok(Err(e)) => warn!(error = %e, "Accept loop failed while draining"),
            Err(e) => error!(error = %e, "Server task failed while draining"),
        }
        true
    }
}

//! The readiness dispatcher.
//!
//! A single task owns the listening socket and every connection that is not
//! currently being served. For each such connection it keeps one *armed*
//! readiness wait in a [`JoinSet`]: a task that resolves when the stream has
//! bytes to read, hits end of stream, fails, or is closed by the registry.
//!
//! ```text
//!   accept ──► NEWLY_ACCEPTED ──► armed wait ──► readable ──► executor
//!                                     ▲                         │
//!                                     └──── Event::Reusable ◄───┘
//! ```
//!
//! A readable connection is taken out of the armed set and handed, stream
//! and all, to the executor. When the exchange is done the worker sends the
//! stream back over the event queue and the dispatcher re-arms it, or drops
//! it if the connection must close.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncBufReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace, warn};

use super::Shared;
use super::exchange;
use super::registry::{Connection, IdleAdmission};
use super::transport::{ConnStream, buffered};

/// Upper bound on how long the dispatcher sleeps without re-checking its phase.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the queue workers use to hand connections back.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Messages from exchange workers back to the dispatcher.
pub(crate) enum Event {
    /// The exchange finished cleanly; the stream may serve another request.
    Reusable { conn: Arc<Connection>, io: ConnStream },
    /// The connection must be closed.
    Close { conn: Arc<Connection> },
}

/// Lifecycle of the dispatcher, driven by the server's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Running,
    /// No new connections; finishing exchanges close their connections.
    Draining,
    Terminated,
}

enum Incoming {
    Fresh(TcpStream),
    Reused(ConnStream),
}

enum Readiness {
    Ready(Arc<Connection>, ConnStream),
    Eof(Arc<Connection>),
    Closed(Arc<Connection>),
    Failed(Arc<Connection>, io::Error),
}

enum Wake {
    Control,
    Shutdown,
    Event(Event),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Readiness(Result<Readiness, JoinError>),
    Tick,
}

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    control: watch::Receiver<Phase>,
    events_tx: mpsc::Sender<Event>,
    events: mpsc::Receiver<Event>,
    armed: JoinSet<Readiness>,
}

impl Dispatcher {
    pub(crate) fn new(
        shared: Arc<Shared>,
        listener: TcpListener,
        control: watch::Receiver<Phase>,
    ) -> Self {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            shared,
            listener: Some(listener),
            control,
            events_tx,
            events,
            armed: JoinSet::new(),
        }
    }

    fn phase(&self) -> Phase {
        *self.control.borrow()
    }

    /// Runs until the control channel reports [`Phase::Terminated`] or the
    /// server handle is dropped.
    pub(crate) async fn run(mut self) {
        info!(
            addr = %self.shared.local_addr,
            protocol = self.shared.protocol,
            "dispatcher started"
        );

        loop {
            match self.phase() {
                Phase::Running => {}
                Phase::Draining => {
                    if self.listener.take().is_some() {
                        info!("no longer accepting connections");
                    }
                }
                Phase::Terminated => break,
            }

            let wake = tokio::select! {
                changed = self.control.changed() => match changed {
                    Ok(()) => Wake::Control,
                    Err(_) => Wake::Shutdown,
                },
                Some(event) = self.events.recv() => Wake::Event(event),
                accepted = accept(self.listener.as_ref()) => Wake::Accepted(accepted),
                Some(joined) = self.armed.join_next(), if !self.armed.is_empty() => {
                    Wake::Readiness(joined)
                }
                () = tokio::time::sleep(POLL_TIMEOUT) => Wake::Tick,
            };

            match wake {
                Wake::Control | Wake::Tick => {}
                Wake::Shutdown => break,
                Wake::Event(event) => self.on_event(event),
                Wake::Accepted(Ok((stream, peer))) => self.on_accept(stream, peer),
                Wake::Accepted(Err(e)) => error!(error = %e, "failed to accept connection"),
                Wake::Readiness(Ok(readiness)) => self.on_readiness(readiness),
                Wake::Readiness(Err(e)) => error!(error = %e, "readiness task failed"),
            }
        }

        // Dropping the armed waits drops the streams they hold.
        self.armed.shutdown().await;
        info!(addr = %self.shared.local_addr, "dispatcher stopped");
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let Some(conn) = self.shared.registry.mark_newly_accepted(peer, Instant::now()) else {
            warn!(peer = %peer, "connection limit reached, dropping connection");
            return;
        };
        if self.shared.config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(conn = conn.id(), error = %e, "failed to set TCP_NODELAY");
            }
        }
        debug!(conn = conn.id(), peer = %peer, "connection accepted");
        self.arm(conn, Incoming::Fresh(stream));
    }

    fn on_readiness(&mut self, readiness: Readiness) {
        let registry = Arc::clone(&self.shared.registry);
        match readiness {
            Readiness::Ready(conn, io) => {
                if self.phase() != Phase::Running {
                    registry.close(&conn);
                    return;
                }
                if let Err(e) = registry.request_started(&conn, Instant::now()) {
                    debug!(conn = conn.id(), error = %e, "connection no longer servable");
                    registry.close(&conn);
                    return;
                }
                trace!(conn = conn.id(), "dispatching exchange");
                let events = self.events_tx.clone();
                let task = exchange::run(Arc::clone(&self.shared), conn, io, events);
                self.shared.executor.execute(Box::pin(task));
            }
            Readiness::Eof(conn) => {
                debug!(conn = conn.id(), "peer closed connection");
                registry.close(&conn);
            }
            Readiness::Closed(conn) => {
                trace!(conn = conn.id(), "armed connection closed");
            }
            Readiness::Failed(conn, e) => {
                debug!(conn = conn.id(), error = %e, "connection failed");
                registry.close(&conn);
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        let registry = Arc::clone(&self.shared.registry);
        match event {
            Event::Reusable { conn, io } => {
                if self.phase() != Phase::Running || conn.is_closed() {
                    registry.close(&conn);
                    return;
                }
                match registry.response_completed(&conn, Instant::now()) {
                    Ok(IdleAdmission::Retained) => self.arm(conn, Incoming::Reused(io)),
                    Ok(IdleAdmission::Closed) => {}
                    Err(e) => {
                        debug!(conn = conn.id(), error = %e, "cannot retain connection");
                        registry.close(&conn);
                    }
                }
            }
            Event::Close { conn } => {
                registry.close(&conn);
            }
        }
    }

    fn arm(&mut self, conn: Arc<Connection>, incoming: Incoming) {
        let tls = self.shared.tls.clone();
        self.armed.spawn(async move {
            let io = match incoming {
                Incoming::Reused(io) => io,
                Incoming::Fresh(stream) => match tls {
                    None => buffered(Box::new(stream)),
                    Some(tls) => {
                        let handshake = tokio::select! {
                            biased;
                            () = conn.closed() => None,
                            wrapped = tls.wrap(stream) => Some(wrapped),
                        };
                        match handshake {
                            None => return Readiness::Closed(conn),
                            Some(Ok(stream)) => buffered(stream),
                            Some(Err(e)) => return Readiness::Failed(conn, e),
                        }
                    }
                },
            };
            wait_readable(conn, io).await
        });
    }
}

async fn wait_readable(conn: Arc<Connection>, mut io: ConnStream) -> Readiness {
    let outcome = tokio::select! {
        biased;
        () = conn.closed() => None,
        filled = io.fill_buf() => Some(filled.map(|buf| buf.is_empty())),
    };
    match outcome {
        None => Readiness::Closed(conn),
        Some(Ok(true)) => Readiness::Eof(conn),
        Some(Ok(false)) => Readiness::Ready(conn, io),
        Some(Err(e)) => Readiness::Failed(conn, e),
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

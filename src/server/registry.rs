//! Connection bookkeeping partitioned by lifecycle state.
//!
//! Every live connection is a member of exactly one of four partitions
//! (NEWLY_ACCEPTED, REQUEST, RESPONSE, IDLE) and of the master map. All
//! partitions sit behind a single mutex so a transition is one atomic
//! move, and so the reapers can re-check a connection's state at the
//! moment they close it.
//!
//! Closing never touches a socket directly. The registry drops its entry
//! and raises the connection's close signal; whichever task currently holds
//! the connection's stream observes the signal and drops the stream.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Identifier assigned to each accepted connection.
pub type ConnId = u64;

/// Lifecycle state of a connection, carrying the instant it was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Accepted, no bytes read yet.
    NewlyAccepted { since: Instant },
    /// A request is being read.
    Request { since: Instant },
    /// The request has been read; the response is being produced.
    Response { since: Instant },
    /// Kept open for reuse after a completed exchange.
    Idle { since: Instant },
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::NewlyAccepted { .. } => StateKind::NewlyAccepted,
            Self::Request { .. } => StateKind::Request,
            Self::Response { .. } => StateKind::Response,
            Self::Idle { .. } => StateKind::Idle,
        }
    }

    /// Instant at which this state was entered.
    pub fn since(&self) -> Instant {
        match *self {
            Self::NewlyAccepted { since }
            | Self::Request { since }
            | Self::Response { since }
            | Self::Idle { since } => since,
        }
    }
}

/// State discriminant, used to name a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    NewlyAccepted,
    Request,
    Response,
    Idle,
}

impl StateKind {
    pub const ALL: [StateKind; 4] = [
        StateKind::NewlyAccepted,
        StateKind::Request,
        StateKind::Response,
        StateKind::Idle,
    ];

    fn index(self) -> usize {
        match self {
            Self::NewlyAccepted => 0,
            Self::Request => 1,
            Self::Response => 2,
            Self::Idle => 3,
        }
    }

    fn enter(self, since: Instant) -> State {
        match self {
            Self::NewlyAccepted => State::NewlyAccepted { since },
            Self::Request => State::Request { since },
            Self::Response => State::Response { since },
            Self::Idle => State::Idle { since },
        }
    }
}

/// Errors from a state transition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("connection {id} is not registered")]
    Unknown { id: ConnId },

    #[error("connection {id} is in {found:?}, expected {expected}")]
    Unexpected {
        id: ConnId,
        expected: &'static str,
        found: StateKind,
    },
}

/// Outcome of moving a connection into IDLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAdmission {
    /// The connection is now idle and may be re-armed.
    Retained,
    /// The idle ceiling was reached; the connection has been closed.
    Closed,
}

/// Shared handle to one accepted connection.
///
/// The handle carries identity and the close signal only. The byte stream
/// travels separately between the dispatcher and the worker that is
/// currently serving the connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    closed: watch::Sender<bool>,
}

impl Connection {
    fn new(id: ConnId, peer: SocketAddr) -> Self {
        let (closed, _) = watch::channel(false);
        Self { id, peer, closed }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // Returns `true` for the call that actually closed the connection.
    fn signal_close(&self) -> bool {
        !self.closed.send_replace(true)
    }
}

/// Per-state connection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub newly_accepted: usize,
    pub request: usize,
    pub response: usize,
    pub idle: usize,
    pub total: usize,
}

struct Tracked {
    conn: Arc<Connection>,
    state: State,
}

#[derive(Default)]
struct Partitions {
    all: HashMap<ConnId, Tracked>,
    members: [HashSet<ConnId>; 4],
}

impl Partitions {
    fn count(&self, kind: StateKind) -> usize {
        self.members[kind.index()].len()
    }

    fn transition(
        &mut self,
        conn: &Connection,
        from: &[StateKind],
        expected: &'static str,
        to: StateKind,
        now: Instant,
    ) -> Result<(), TransitionError> {
        let tracked = self
            .all
            .get_mut(&conn.id)
            .ok_or(TransitionError::Unknown { id: conn.id })?;
        let found = tracked.state.kind();
        if !from.contains(&found) {
            return Err(TransitionError::Unexpected {
                id: conn.id,
                expected,
                found,
            });
        }
        tracked.state = to.enter(now);
        self.members[found.index()].remove(&conn.id);
        self.members[to.index()].insert(conn.id);
        Ok(())
    }

    fn remove(&mut self, id: ConnId) -> Option<Tracked> {
        let tracked = self.all.remove(&id)?;
        self.members[tracked.state.kind().index()].remove(&id);
        Some(tracked)
    }
}

/// Registry of every live connection.
///
/// # Examples
///
/// ```
/// use std::time::Instant;
/// use http_engine::server::registry::{ConnectionRegistry, StateKind};
///
/// let registry = ConnectionRegistry::new(None, 10);
/// let now = Instant::now();
/// let conn = registry.mark_newly_accepted("127.0.0.1:9".parse().unwrap(), now).unwrap();
///
/// registry.request_started(&conn, now).unwrap();
/// assert_eq!(registry.state_of(&conn).map(|s| s.kind()), Some(StateKind::Request));
///
/// assert!(registry.close(&conn));
/// assert!(!registry.close(&conn));
/// assert!(conn.is_closed());
/// ```
pub struct ConnectionRegistry {
    inner: Mutex<Partitions>,
    max_connections: Option<usize>,
    max_idle: usize,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(max_connections: Option<usize>, max_idle: usize) -> Self {
        Self {
            inner: Mutex::new(Partitions::default()),
            max_connections,
            max_idle,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Partitions> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a freshly accepted connection in NEWLY_ACCEPTED.
    ///
    /// Returns `None` when the open-connection ceiling has been reached; the
    /// caller must then drop the socket without further processing.
    pub fn mark_newly_accepted(&self, peer: SocketAddr, now: Instant) -> Option<Arc<Connection>> {
        let mut parts = self.lock();
        if self.max_connections.is_some_and(|max| parts.all.len() >= max) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, peer));
        parts.all.insert(
            id,
            Tracked {
                conn: Arc::clone(&conn),
                state: State::NewlyAccepted { since: now },
            },
        );
        parts.members[StateKind::NewlyAccepted.index()].insert(id);
        Some(conn)
    }

    /// NEWLY_ACCEPTED or IDLE → REQUEST, on the first readable byte.
    pub fn request_started(&self, conn: &Connection, now: Instant) -> Result<(), TransitionError> {
        self.lock().transition(
            conn,
            &[StateKind::NewlyAccepted, StateKind::Idle],
            "NEWLY_ACCEPTED or IDLE",
            StateKind::Request,
            now,
        )
    }

    /// REQUEST → RESPONSE, once the request has been read in full.
    pub fn request_completed(
        &self,
        conn: &Connection,
        now: Instant,
    ) -> Result<(), TransitionError> {
        self.lock()
            .transition(conn, &[StateKind::Request], "REQUEST", StateKind::Response, now)
    }

    /// RESPONSE → IDLE, once the response has been flushed.
    ///
    /// Enforces the idle ceiling: when the IDLE partition is already full
    /// the connection is closed instead of retained.
    pub fn response_completed(
        &self,
        conn: &Connection,
        now: Instant,
    ) -> Result<IdleAdmission, TransitionError> {
        let mut parts = self.lock();
        let found = parts
            .all
            .get(&conn.id)
            .map(|t| t.state.kind())
            .ok_or(TransitionError::Unknown { id: conn.id })?;
        if found != StateKind::Response {
            return Err(TransitionError::Unexpected {
                id: conn.id,
                expected: "RESPONSE",
                found,
            });
        }

        if parts.count(StateKind::Idle) >= self.max_idle {
            if let Some(tracked) = parts.remove(conn.id) {
                tracked.conn.signal_close();
            }
            debug!(conn = conn.id, max_idle = self.max_idle, "idle ceiling reached, closing");
            return Ok(IdleAdmission::Closed);
        }

        parts.transition(conn, &[StateKind::Response], "RESPONSE", StateKind::Idle, now)?;
        Ok(IdleAdmission::Retained)
    }

    /// Removes the connection from every partition and raises its close
    /// signal. Idempotent; returns `true` only for the call that removed it.
    pub fn close(&self, conn: &Connection) -> bool {
        let removed = self.lock().remove(conn.id).is_some();
        conn.signal_close();
        removed
    }

    /// Snapshot of connections that have been in `kind` for at least `threshold`.
    pub fn expired(
        &self,
        kind: StateKind,
        threshold: Duration,
        now: Instant,
    ) -> Vec<Arc<Connection>> {
        let parts = self.lock();
        parts.members[kind.index()]
            .iter()
            .filter_map(|id| parts.all.get(id))
            .filter(|t| now.saturating_duration_since(t.state.since()) >= threshold)
            .map(|t| Arc::clone(&t.conn))
            .collect()
    }

    /// Closes `conn` only if it is still in `kind` and has been for at least
    /// `threshold`. A connection that moved on since it was snapshotted is
    /// left alone.
    pub fn close_if_expired(
        &self,
        conn: &Connection,
        kind: StateKind,
        threshold: Duration,
        now: Instant,
    ) -> bool {
        let mut parts = self.lock();
        let still_expired = parts.all.get(&conn.id).is_some_and(|t| {
            t.state.kind() == kind && now.saturating_duration_since(t.state.since()) >= threshold
        });
        if !still_expired {
            return false;
        }
        if let Some(tracked) = parts.remove(conn.id) {
            tracked.conn.signal_close();
        }
        true
    }

    /// Closes every connection currently in `kind`.
    pub fn close_state(&self, kind: StateKind) -> usize {
        let mut parts = self.lock();
        let ids: Vec<ConnId> = parts.members[kind.index()].iter().copied().collect();
        for id in &ids {
            if let Some(tracked) = parts.remove(*id) {
                tracked.conn.signal_close();
            }
        }
        ids.len()
    }

    /// Closes every registered connection.
    pub fn close_all(&self) -> usize {
        let mut parts = self.lock();
        let drained: Vec<Tracked> = parts.all.drain().map(|(_, t)| t).collect();
        for members in parts.members.iter_mut() {
            members.clear();
        }
        drop(parts);
        for tracked in &drained {
            tracked.conn.signal_close();
        }
        drained.len()
    }

    pub fn state_of(&self, conn: &Connection) -> Option<State> {
        self.lock().all.get(&conn.id).map(|t| t.state)
    }

    pub fn contains(&self, conn: &Connection) -> bool {
        self.lock().all.contains_key(&conn.id)
    }

    pub fn count(&self, kind: StateKind) -> usize {
        self.lock().count(kind)
    }

    /// Connections with an exchange in progress (REQUEST or RESPONSE).
    pub fn in_flight(&self) -> usize {
        let parts = self.lock();
        parts.count(StateKind::Request) + parts.count(StateKind::Response)
    }

    pub fn len(&self) -> usize {
        self.lock().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ConnectionStats {
        let parts = self.lock();
        ConnectionStats {
            newly_accepted: parts.count(StateKind::NewlyAccepted),
            request: parts.count(StateKind::Request),
            response: parts.count(StateKind::Response),
            idle: parts.count(StateKind::Idle),
            total: parts.all.len(),
        }
    }

    /// Checks that every registered connection is in exactly the partition
    /// named by its state, and that no partition holds strays.
    pub fn is_consistent(&self) -> bool {
        let parts = self.lock();
        let members_total: usize = parts.members.iter().map(HashSet::len).sum();
        members_total == parts.all.len()
            && parts.all.iter().all(|(id, t)| {
                StateKind::ALL
                    .iter()
                    .all(|k| parts.members[k.index()].contains(id) == (*k == t.state.kind()))
            })
    }
}

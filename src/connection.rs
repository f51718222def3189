//! Per-connection state shared between the connector, concierges and publishers.
//!
//! Every accepted socket gets a [`ConnectionState`] registered in the server's
//! [`Registry`] under a fresh [`ConnectionId`]. The concierge that owns the socket
//! reads requests from it; whoever answers (the concierge itself on a cache hit,
//! a publisher after a decode) writes through [`ConnectionState::send`].
//!
//! The `tasked` flag records that a decode for this connection is in flight. The
//! concierge sets it before queueing a task and then sleeps on
//! [`ConnectionState::wait_resolved`]; the publisher clears it with
//! [`ConnectionState::resolve`] once the payload has been written.
use std::{
    collections::HashMap,
    fmt,
    io,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use log::debug;

use crate::{
    protocol::{TransportError, transport},
    sync::lock,
};

/// Routing key for decode results. Never reused within one server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct ConnectionState {
    id: ConnectionId,
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    control: TcpStream,
    tasked: Mutex<bool>,
    resolved: Condvar,
}

impl ConnectionState {
    /// Wraps a write handle cloned from `stream`, plus an unlocked clone used
    /// only to shut the socket down.
    pub fn new(id: ConnectionId, peer: SocketAddr, stream: &TcpStream) -> io::Result<Self> {
        Ok(Self {
            id,
            peer,
            writer: Mutex::new(stream.try_clone()?),
            control: stream.try_clone()?,
            tasked: Mutex::new(false),
            resolved: Condvar::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sends one framed payload to the client.
    pub fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut writer = lock(&self.writer);
        transport::send(&mut *writer, payload)
    }

    pub fn is_tasked(&self) -> bool {
        *lock(&self.tasked)
    }

    pub fn mark_tasked(&self) {
        *lock(&self.tasked) = true;
    }

    /// Clears the tasked flag and wakes the waiting concierge.
    pub fn resolve(&self) {
        *lock(&self.tasked) = false;
        self.resolved.notify_all();
    }

    /// Blocks for up to `timeout` until the connection is no longer tasked.
    ///
    /// Returns `true` once resolved, `false` if the timeout elapsed first.
    pub fn wait_resolved(&self, timeout: Duration) -> bool {
        let tasked = lock(&self.tasked);
        let (tasked, _) = self
            .resolved
            .wait_timeout_while(tasked, timeout, |tasked| *tasked)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !*tasked
    }

    /// Shuts the socket down in both directions, waking any blocked reader or
    /// writer. Does not wait for a send in progress.
    pub fn shutdown(&self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            debug!("connection {} already closed: {e}", self.id);
        }
    }
}

/// Live connections keyed by id.
#[derive(Debug, Default)]
pub struct Registry {
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionState>>>,
    next: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn insert(&self, state: Arc<ConnectionState>) {
        lock(&self.connections).insert(state.id(), state);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        lock(&self.connections).get(&id).cloned()
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        lock(&self.connections).remove(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of connections currently waiting on a decode.
    pub fn tasked(&self) -> usize {
        lock(&self.connections)
            .values()
            .filter(|state| state.is_tasked())
            .count()
    }

    /// Shuts down every registered socket without unregistering it.
    pub fn shutdown_all(&self) {
        let connections: Vec<_> = lock(&self.connections).values().cloned().collect();
        for state in connections {
            state.shutdown();
        }
    }

    pub fn clear(&self) {
        lock(&self.connections).clear();
    }
}

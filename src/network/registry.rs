//! Connection Registry
//!
//! One live connection per player. Every state change is a compare-and-set
//! on (player, connection id, expected state), so a stale handle can never
//! move a newer connection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

use crate::game::state::PlayerId;
use crate::network::protocol::ServerMessage;
use crate::network::session::SessionId;
use crate::persistence::Identity;

/// Process-unique connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Lifecycle state of a registered connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Queued,
    InSession(SessionId),
}

/// Cheap, cloneable reference to one connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn_id: ConnectionId,
    identity: Arc<Identity>,
    sender: mpsc::Sender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(conn_id: ConnectionId, identity: Identity, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            conn_id,
            identity: Arc::new(identity),
            sender,
        }
    }

    #[inline]
    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    #[inline]
    pub fn player_id(&self) -> PlayerId {
        self.identity.player_id
    }

    #[inline]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Outbound channel to the connection's writer.
    #[inline]
    pub fn sender(&self) -> &mpsc::Sender<ServerMessage> {
        &self.sender
    }

    /// Whether this is the same connection (not just the same player).
    #[inline]
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.conn_id == other.conn_id
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("conn_id", &self.conn_id)
            .field("player", &self.identity.player_id)
            .field("username", &self.identity.username)
            .finish()
    }
}

/// The entry a new registration replaced.
#[derive(Debug)]
pub struct Superseded {
    pub handle: ConnectionHandle,
    pub state: ConnectionState,
}

/// Outcome of [`ConnectionRegistry::register`].
pub struct Registration {
    pub handle: ConnectionHandle,
    /// Fires when a newer login replaces this connection.
    pub kicked: oneshot::Receiver<()>,
    pub superseded: Option<Superseded>,
}

struct Entry {
    handle: ConnectionHandle,
    state: ConnectionState,
    kick: Option<oneshot::Sender<()>>,
}

/// Live connections keyed by player.
pub struct ConnectionRegistry {
    entries: RwLock<BTreeMap<PlayerId, Entry>>,
    next_conn_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a connection in state Idle.
    ///
    /// An existing connection for the same player is replaced; its kick
    /// signal fires and its prior state is returned for teardown.
    pub async fn register(&self, identity: Identity, sender: mpsc::Sender<ServerMessage>) -> Registration {
        let conn_id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let handle = ConnectionHandle::new(conn_id, identity, sender);
        let (kick_tx, kicked) = oneshot::channel();

        let previous = self.entries.write().await.insert(
            handle.player_id(),
            Entry {
                handle: handle.clone(),
                state: ConnectionState::Idle,
                kick: Some(kick_tx),
            },
        );

        let superseded = previous.map(|mut old| {
            if let Some(kick) = old.kick.take() {
                let _ = kick.send(());
            }
            info!(
                "Player {} superseded {} with {} (was {:?})",
                handle.player_id(),
                old.handle.conn_id(),
                conn_id,
                old.state
            );
            Superseded {
                handle: old.handle,
                state: old.state,
            }
        });

        debug!("Registered {} for player {}", conn_id, handle.player_id());
        Registration {
            handle,
            kicked,
            superseded,
        }
    }

    /// Remove the entry if it still belongs to `handle`'s connection.
    ///
    /// Returns the state the connection was in, or `None` if it was already
    /// gone or superseded.
    pub async fn unregister(&self, handle: &ConnectionHandle) -> Option<ConnectionState> {
        let mut entries = self.entries.write().await;
        match entries.get(&handle.player_id()) {
            Some(entry) if entry.handle.same_connection(handle) => {
                let state = entry.state;
                entries.remove(&handle.player_id());
                debug!("Unregistered {} (was {:?})", handle.conn_id(), state);
                Some(state)
            }
            _ => None,
        }
    }

    /// Current connection for a player.
    pub async fn lookup(&self, player: PlayerId) -> Option<ConnectionHandle> {
        self.entries.read().await.get(&player).map(|e| e.handle.clone())
    }

    /// Current state for a player.
    pub async fn state_of(&self, player: PlayerId) -> Option<ConnectionState> {
        self.entries.read().await.get(&player).map(|e| e.state)
    }

    /// State of `handle`'s connection, `None` if it is no longer current.
    pub async fn connection_state(&self, handle: &ConnectionHandle) -> Option<ConnectionState> {
        self.entries
            .read()
            .await
            .get(&handle.player_id())
            .filter(|e| e.handle.same_connection(handle))
            .map(|e| e.state)
    }

    /// Snapshot of every live connection.
    pub async fn handles(&self) -> Vec<ConnectionHandle> {
        self.entries.read().await.values().map(|e| e.handle.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Idle -> Queued.
    pub async fn begin_queue(&self, handle: &ConnectionHandle) -> bool {
        self.transition(handle, ConnectionState::Idle, ConnectionState::Queued).await
    }

    /// Queued -> Idle.
    pub async fn end_queue(&self, handle: &ConnectionHandle) -> bool {
        self.transition(handle, ConnectionState::Queued, ConnectionState::Idle).await
    }

    /// Idle -> InSession, used when a player resumes a paused session.
    pub async fn attach_session(&self, handle: &ConnectionHandle, session: SessionId) -> bool {
        self.transition(handle, ConnectionState::Idle, ConnectionState::InSession(session))
            .await
    }

    /// Move both players into `session`. All-or-nothing.
    ///
    /// Each handle must still be the player's current connection, in state
    /// Idle or Queued.
    pub async fn begin_session(
        &self,
        a: &ConnectionHandle,
        b: &ConnectionHandle,
        session: SessionId,
    ) -> bool {
        let mut entries = self.entries.write().await;

        let eligible = |handle: &ConnectionHandle| {
            entries.get(&handle.player_id()).is_some_and(|entry| {
                entry.handle.same_connection(handle)
                    && matches!(entry.state, ConnectionState::Idle | ConnectionState::Queued)
            })
        };
        if a.player_id() == b.player_id() || !eligible(a) || !eligible(b) {
            return false;
        }

        for handle in [a, b] {
            if let Some(entry) = entries.get_mut(&handle.player_id()) {
                entry.state = ConnectionState::InSession(session);
            }
        }
        true
    }

    /// InSession(session) -> Idle for whichever connection the player has now.
    pub async fn release_session(&self, player: PlayerId, session: SessionId) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&player) {
            Some(entry) if entry.state == ConnectionState::InSession(session) => {
                entry.state = ConnectionState::Idle;
                true
            }
            _ => false,
        }
    }

    async fn transition(
        &self,
        handle: &ConnectionHandle,
        from: ConnectionState,
        to: ConnectionState,
    ) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&handle.player_id()) {
            Some(entry) if entry.handle.same_connection(handle) && entry.state == from => {
                entry.state = to;
                true
            }
            _ => false,
        }
    }
}

//! Lobby
//!
//! Connection lifecycle on top of the registry, queue and session manager.
//! Locks are always taken in the order queue, session table, registry, and
//! the session table and registry are never held together.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::game::input::PaddleDirection;
use crate::network::broadcast::EventBroadcaster;
use crate::network::matchmaking::{MatchmakingConfig, MatchmakingQueue, QueueEntry, QueueTicket};
use crate::network::protocol::{Difficulty, ErrorCode, QueueState, QueueStatus, ServerMessage};
use crate::network::registry::{ConnectionHandle, ConnectionRegistry, ConnectionState, Registration};
use crate::network::session::SessionManager;
use crate::persistence::{Identity, TerminationReason};

/// Lobby operation errors, reported to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LobbyError {
    #[error("already waiting for a match")]
    AlreadyQueued,

    #[error("already in a match")]
    AlreadyInMatch,

    #[error("not in a match")]
    NotInMatch,

    #[error("connection was replaced by a newer login")]
    NotConnected,
}

impl LobbyError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            LobbyError::AlreadyQueued => ErrorCode::AlreadyQueued,
            LobbyError::AlreadyInMatch => ErrorCode::AlreadyInMatch,
            LobbyError::NotInMatch => ErrorCode::NotInMatch,
            LobbyError::NotConnected => ErrorCode::Superseded,
        }
    }
}

/// Matchmaking and session front door.
pub struct Lobby {
    queue: Mutex<MatchmakingQueue>,
    sessions: Arc<SessionManager>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: EventBroadcaster,
}

impl Lobby {
    pub fn new(
        config: MatchmakingConfig,
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<SessionManager>,
        broadcaster: EventBroadcaster,
    ) -> Self {
        Self {
            queue: Mutex::new(MatchmakingQueue::new(config)),
            sessions,
            registry,
            broadcaster,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Players waiting for a match.
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    // ===== CONNECTION LIFECYCLE =====

    /// Register an authenticated connection.
    ///
    /// A session holding this player moves to the new connection. A previous
    /// connection is told it was replaced and its queue entry dropped; if it
    /// was in the session just handed over, the session swaps connections
    /// without pausing.
    pub async fn connect(&self, identity: Identity, sender: mpsc::Sender<ServerMessage>) -> Registration {
        let registration = self.registry.register(identity, sender).await;
        let handle = registration.handle.clone();

        let rejoined = match self.sessions.session_for(handle.player_id()).await {
            Some(session_id) => {
                let sent = self.sessions.reconnect(session_id, handle.clone()).await;
                if sent {
                    info!("Player {} rejoining session {}", handle.player_id(), session_id);
                }
                sent
            }
            None => false,
        };

        if let Some(old) = &registration.superseded {
            self.broadcaster.send(
                &old.handle,
                ServerMessage::error(ErrorCode::Superseded, "logged in from another connection"),
            );
            let handed_over = rejoined && matches!(old.state, ConnectionState::InSession(_));
            if !handed_over {
                self.teardown(&old.handle, old.state).await;
            }
        }

        registration
    }

    /// Tear down a closed connection: registry, then queue, then session.
    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        match self.registry.unregister(handle).await {
            Some(state) => self.teardown(handle, state).await,
            None => debug!("{} already gone", handle.conn_id()),
        }
    }

    async fn teardown(&self, handle: &ConnectionHandle, state: ConnectionState) {
        match state {
            ConnectionState::Idle => {}
            ConnectionState::Queued => {
                if self.queue.lock().await.cancel(handle).is_some() {
                    debug!("Removed {} from queue", handle.conn_id());
                }
            }
            ConnectionState::InSession(session_id) => {
                self.sessions
                    .player_disconnected(session_id, handle.player_id(), handle.conn_id())
                    .await;
            }
        }
    }

    // ===== MATCHMAKING =====

    /// Put a connection in the queue and pair whoever is ready.
    pub async fn join_queue(
        &self,
        handle: &ConnectionHandle,
        difficulty: Difficulty,
    ) -> Result<QueueTicket, LobbyError> {
        let mut queue = self.queue.lock().await;

        if self.sessions.session_for(handle.player_id()).await.is_some() {
            return Err(LobbyError::AlreadyInMatch);
        }
        if !self.registry.begin_queue(handle).await {
            return Err(match self.registry.connection_state(handle).await {
                Some(ConnectionState::Queued) => LobbyError::AlreadyQueued,
                Some(ConnectionState::InSession(_)) => LobbyError::AlreadyInMatch,
                _ => LobbyError::NotConnected,
            });
        }

        let now = Instant::now();
        let ticket = match queue.enqueue(handle.clone(), difficulty, now) {
            Ok(ticket) => ticket,
            Err(_) => {
                self.registry.end_queue(handle).await;
                return Err(LobbyError::AlreadyQueued);
            }
        };
        debug!("Player {} queued ({:?}, ticket {})", handle.player_id(), difficulty, ticket);

        self.pair_ready(&mut queue, now).await;
        self.notify_waiting(&queue);
        Ok(ticket)
    }

    /// Leave the queue. `Ok(false)` if the entry was already gone, e.g.
    /// paired an instant earlier.
    pub async fn cancel_queue(&self, handle: &ConnectionHandle) -> Result<bool, LobbyError> {
        let mut queue = self.queue.lock().await;
        match queue.cancel(handle) {
            Some(entry) => {
                self.registry.end_queue(handle).await;
                debug!("Player {} cancelled ticket {}", handle.player_id(), entry.ticket);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pair, then expire stale entries. Runs from the periodic sweep.
    pub async fn sweep(&self) {
        let mut queue = self.queue.lock().await;
        let now = Instant::now();
        let before = queue.len();

        self.pair_ready(&mut queue, now).await;

        for entry in queue.expire(now) {
            self.registry.end_queue(&entry.handle).await;
            info!("Player {} timed out in queue", entry.player_id());
            self.broadcaster.send(
                &entry.handle,
                ServerMessage::QueueStatus(QueueStatus {
                    ticket: entry.ticket,
                    status: QueueState::TimedOut,
                    difficulty: entry.difficulty,
                    position: 0,
                    waiting: queue.len(),
                }),
            );
        }

        if queue.len() != before {
            self.notify_waiting(&queue);
        }
    }

    /// Run [`Lobby::sweep`] on the configured interval until shutdown.
    pub fn spawn_sweep(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let lobby = Arc::clone(self);
        tokio::spawn(async move {
            let period = lobby.queue.lock().await.config().sweep_interval;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Matchmaking sweep stopping");
                        break;
                    }
                    _ = interval.tick() => lobby.sweep().await,
                }
            }
        })
    }

    /// Hand every ready pair to the session manager.
    ///
    /// If a session cannot start because a player vanished, the survivor
    /// goes back to its original place in the queue.
    async fn pair_ready(&self, queue: &mut MatchmakingQueue, now: Instant) {
        let mut survivors: Vec<QueueEntry> = Vec::new();

        while let Some((first, second)) = queue.try_pair(now) {
            match self
                .sessions
                .create_session(first.handle.clone(), second.handle.clone())
                .await
            {
                Ok(session_id) => {
                    info!(
                        "Paired {} ({:?}) with {} ({:?}) in session {}",
                        first.player_id(),
                        first.difficulty,
                        second.player_id(),
                        second.difficulty,
                        session_id
                    );
                }
                Err(e) => {
                    debug!("Pairing {} / {} failed: {}", first.player_id(), second.player_id(), e);
                    for entry in [first, second] {
                        let state = self.registry.connection_state(&entry.handle).await;
                        if state == Some(ConnectionState::Queued) {
                            survivors.push(entry);
                        }
                    }
                }
            }
        }

        // Requeued after the loop so a failed pair is not retried forever
        for entry in survivors {
            queue.requeue(entry);
        }
    }

    fn notify_waiting(&self, queue: &MatchmakingQueue) {
        let waiting = queue.len();
        for (index, entry) in queue.entries().enumerate() {
            self.broadcaster.send(
                &entry.handle,
                ServerMessage::QueueStatus(QueueStatus {
                    ticket: entry.ticket,
                    status: QueueState::Searching,
                    difficulty: entry.difficulty,
                    position: index + 1,
                    waiting,
                }),
            );
        }
    }

    // ===== IN-MATCH =====

    /// Forward a paddle intent to the player's session.
    pub async fn submit_input(
        &self,
        handle: &ConnectionHandle,
        direction: PaddleDirection,
    ) -> Result<(), LobbyError> {
        match self.registry.connection_state(handle).await {
            Some(ConnectionState::InSession(session_id)) => self
                .sessions
                .submit_input(session_id, handle.player_id(), direction)
                .await
                .map_err(|_| LobbyError::NotInMatch),
            _ => Err(LobbyError::NotInMatch),
        }
    }

    /// Leave whatever the connection is doing: cancel the queue entry or
    /// forfeit the match.
    pub async fn leave(&self, handle: &ConnectionHandle) -> Result<(), LobbyError> {
        match self.registry.connection_state(handle).await {
            Some(ConnectionState::Queued) => {
                self.cancel_queue(handle).await?;
                Ok(())
            }
            Some(ConnectionState::InSession(session_id)) => {
                let reason = TerminationReason::Forfeit {
                    player: handle.player_id(),
                };
                if !self.sessions.terminate(session_id, reason).await {
                    debug!("Session {} already over", session_id);
                }
                Ok(())
            }
            Some(ConnectionState::Idle) => Err(LobbyError::NotInMatch),
            None => Err(LobbyError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::network::session::{SessionConfig, SessionId};
    use crate::persistence::{MemoryStore, PersistenceGateway};

    struct Harness {
        lobby: Arc<Lobby>,
        store: Arc<MemoryStore>,
    }

    async fn harness(matchmaking: MatchmakingConfig) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let broadcaster = EventBroadcaster::new();
        let sessions = Arc::new(SessionManager::new(
            SessionConfig {
                grace: Duration::from_secs(5),
                ..SessionConfig::default()
            },
            Arc::clone(&registry),
            store.clone(),
            broadcaster.clone(),
        ));
        let lobby = Arc::new(Lobby::new(matchmaking, registry, sessions, broadcaster));
        Harness { lobby, store }
    }

    async fn connect(h: &Harness, name: &str) -> (Registration, mpsc::Receiver<ServerMessage>) {
        let identity = match h.store.get_user_identity(name).await.unwrap() {
            Some(identity) => identity,
            None => h.store.create_user(name, name, "CODE ALLIANCE").await.unwrap(),
        };
        let (tx, rx) = mpsc::channel(8192);
        (h.lobby.connect(identity, tx).await, rx)
    }

    async fn next_where(
        rx: &mut mpsc::Receiver<ServerMessage>,
        pred: impl Fn(&ServerMessage) -> bool,
    ) -> ServerMessage {
        loop {
            let msg = rx.recv().await.expect("connection channel closed");
            if pred(&msg) {
                return msg;
            }
        }
    }

    fn is_match_found(msg: &ServerMessage) -> bool {
        matches!(msg, ServerMessage::MatchFound(_))
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_players_get_paired() {
        let h = harness(MatchmakingConfig::default()).await;
        let (a, mut rx_a) = connect(&h, "alice").await;
        let (b, mut rx_b) = connect(&h, "bob").await;

        h.lobby.join_queue(&a.handle, Difficulty::Normal).await.unwrap();
        match rx_a.recv().await.unwrap() {
            ServerMessage::QueueStatus(status) => {
                assert_eq!(status.status, QueueState::Searching);
                assert_eq!((status.position, status.waiting), (1, 1));
            }
            other => panic!("expected queue_status, got {:?}", other),
        }

        h.lobby.join_queue(&b.handle, Difficulty::Normal).await.unwrap();

        let found_a = next_where(&mut rx_a, is_match_found).await;
        let found_b = next_where(&mut rx_b, is_match_found).await;
        assert_eq!(found_a.session_id(), found_b.session_id());
        assert_eq!(h.lobby.queue_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_twice_rejected() {
        let h = harness(MatchmakingConfig::default()).await;
        let (a, _rx) = connect(&h, "alice").await;

        h.lobby.join_queue(&a.handle, Difficulty::Easy).await.unwrap();
        assert_eq!(
            h.lobby.join_queue(&a.handle, Difficulty::Easy).await,
            Err(LobbyError::AlreadyQueued)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_then_cancel_again() {
        let h = harness(MatchmakingConfig::default()).await;
        let (a, _rx) = connect(&h, "alice").await;

        h.lobby.join_queue(&a.handle, Difficulty::Hard).await.unwrap();
        assert_eq!(h.lobby.cancel_queue(&a.handle).await, Ok(true));
        assert_eq!(h.lobby.cancel_queue(&a.handle).await, Ok(false));
        assert_eq!(
            h.lobby.registry().state_of(a.handle.player_id()).await,
            Some(ConnectionState::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_removes_queue_entry() {
        let h = harness(MatchmakingConfig::default()).await;
        let (a, _rx) = connect(&h, "alice").await;
        h.lobby.join_queue(&a.handle, Difficulty::Normal).await.unwrap();

        h.lobby.disconnect(&a.handle).await;

        assert_eq!(h.lobby.queue_len().await, 0);
        assert!(h.lobby.registry().lookup(a.handle.player_id()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_widens_and_expires() {
        let h = harness(MatchmakingConfig {
            widen_after: Duration::from_secs(10),
            max_wait: Duration::from_secs(20),
            ..MatchmakingConfig::default()
        })
        .await;
        let (a, mut rx_a) = connect(&h, "alice").await;
        let (b, mut rx_b) = connect(&h, "bob").await;
        h.lobby.join_queue(&a.handle, Difficulty::Easy).await.unwrap();
        h.lobby.join_queue(&b.handle, Difficulty::Hard).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        h.lobby.sweep().await;
        next_where(&mut rx_a, is_match_found).await;
        next_where(&mut rx_b, is_match_found).await;

        let (c, mut rx_c) = connect(&h, "carol").await;
        h.lobby.join_queue(&c.handle, Difficulty::Normal).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        h.lobby.sweep().await;

        let timed_out = next_where(&mut rx_c, |m| {
            matches!(m, ServerMessage::QueueStatus(s) if s.status == QueueState::TimedOut)
        })
        .await;
        assert!(matches!(timed_out, ServerMessage::QueueStatus(_)));
        assert_eq!(
            h.lobby.registry().state_of(c.handle.player_id()).await,
            Some(ConnectionState::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_forfeits_match() {
        let h = harness(MatchmakingConfig::default()).await;
        let (a, mut rx_a) = connect(&h, "alice").await;
        let (b, _rx_b) = connect(&h, "bob").await;
        h.lobby.join_queue(&a.handle, Difficulty::Normal).await.unwrap();
        h.lobby.join_queue(&b.handle, Difficulty::Normal).await.unwrap();
        next_where(&mut rx_a, is_match_found).await;

        h.lobby.leave(&b.handle).await.unwrap();

        match next_where(&mut rx_a, |m| matches!(m, ServerMessage::MatchEnded(_))).await {
            ServerMessage::MatchEnded(info) => {
                assert_eq!(info.winner, a.handle.player_id());
                assert_eq!(info.reason, TerminationReason::Forfeit { player: b.handle.player_id() });
            }
            _ => unreachable!(),
        }
        assert_eq!(h.lobby.leave(&b.handle).await, Err(LobbyError::NotInMatch));
        assert_eq!(h.store.history().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_session() {
        let h = harness(MatchmakingConfig::default()).await;
        let (a, mut rx_a) = connect(&h, "alice").await;
        let (b, _rx_b) = connect(&h, "bob").await;
        h.lobby.join_queue(&a.handle, Difficulty::Normal).await.unwrap();
        h.lobby.join_queue(&b.handle, Difficulty::Normal).await.unwrap();
        let session_id = next_where(&mut rx_a, is_match_found).await.session_id();

        h.lobby.disconnect(&b.handle).await;
        next_where(&mut rx_a, |m| matches!(m, ServerMessage::SessionPaused { .. })).await;

        let (b2, mut rx_b2) = connect(&h, "bob").await;
        match next_where(&mut rx_b2, is_match_found).await {
            ServerMessage::MatchFound(info) => {
                assert!(info.resumed);
                assert_eq!(Some(info.session_id), session_id);
            }
            _ => unreachable!(),
        }
        next_where(&mut rx_a, |m| matches!(m, ServerMessage::SessionResumed { .. })).await;

        // Rejoined player cannot queue while still in the match
        assert_eq!(
            h.lobby.join_queue(&b2.handle, Difficulty::Normal).await,
            Err(LobbyError::AlreadyInMatch)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_supersede_while_queued() {
        let h = harness(MatchmakingConfig::default()).await;
        let (a1, mut rx_a1) = connect(&h, "alice").await;
        h.lobby.join_queue(&a1.handle, Difficulty::Normal).await.unwrap();

        let (a2, _rx_a2) = connect(&h, "alice").await;

        assert!(a2.superseded.is_some());
        assert_eq!(h.lobby.queue_len().await, 0);
        next_where(&mut rx_a1, |m| matches!(m, ServerMessage::Error(_))).await;
        assert!(a1.kicked.await.is_ok());
    }

    /// Drain everything delivered so far.
    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn paired(h: &Harness) -> (Registration, mpsc::Receiver<ServerMessage>, Registration, SessionId) {
        let (a, mut rx_a) = connect(h, "alice").await;
        let (b, _rx_b) = connect(h, "bob").await;
        h.lobby.join_queue(&a.handle, Difficulty::Normal).await.unwrap();
        h.lobby.join_queue(&b.handle, Difficulty::Normal).await.unwrap();
        let session_id = next_where(&mut rx_a, is_match_found)
            .await
            .session_id()
            .expect("match_found carries a session id");
        (a, rx_a, b, session_id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_between_unregister_and_teardown_keeps_match() {
        let h = harness(MatchmakingConfig::default()).await;
        let (a, mut rx_a, b, session_id) = paired(&h).await;

        // Old socket closes: registry entry released first
        assert_eq!(
            h.lobby.registry().unregister(&b.handle).await,
            Some(ConnectionState::InSession(session_id))
        );
        // A fresh login lands before the session hears about the close
        let (b2, mut rx_b2) = connect(&h, "bob").await;
        assert!(b2.superseded.is_none());
        h.lobby
            .teardown(&b.handle, ConnectionState::InSession(session_id))
            .await;

        match next_where(&mut rx_b2, is_match_found).await {
            ServerMessage::MatchFound(info) => {
                assert!(info.resumed);
                assert_eq!(info.session_id, session_id);
            }
            _ => unreachable!(),
        }

        // Well past the 5 s grace
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(
            h.lobby.registry().connection_state(&b2.handle).await,
            Some(ConnectionState::InSession(session_id))
        );
        assert_eq!(h.lobby.sessions().session_count().await, 1);
        assert!(h.store.history().await.is_empty());
        assert!(!drain(&mut rx_a).iter().any(|m| matches!(
            m,
            ServerMessage::SessionPaused { .. } | ServerMessage::MatchEnded(_)
        )));
        h.lobby.submit_input(&b2.handle, PaddleDirection::Up).await.unwrap();
        assert!(h.lobby.registry().connection_state(&a.handle).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supersede_in_match_swaps_without_pause() {
        let h = harness(MatchmakingConfig::default()).await;
        let (_a, mut rx_a, b, session_id) = paired(&h).await;

        let (b2, mut rx_b2) = connect(&h, "bob").await;
        assert!(b2.superseded.is_some());

        match next_where(&mut rx_b2, is_match_found).await {
            ServerMessage::MatchFound(info) => assert!(info.resumed),
            _ => unreachable!(),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = drain(&mut rx_a);
        assert!(seen.iter().any(|m| matches!(m, ServerMessage::StateUpdate(_))));
        assert!(!seen.iter().any(|m| matches!(
            m,
            ServerMessage::SessionPaused { .. } | ServerMessage::SessionResumed { .. }
        )));
        assert_eq!(
            h.lobby.registry().connection_state(&b2.handle).await,
            Some(ConnectionState::InSession(session_id))
        );
        // The replaced connection's own teardown is a no-op for the session
        h.lobby.disconnect(&b.handle).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.lobby.sessions().session_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_connection_gets_superseded_code() {
        let h = harness(MatchmakingConfig::default()).await;
        let (a1, _rx1) = connect(&h, "alice").await;
        let (_a2, _rx2) = connect(&h, "alice").await;

        let err = h.lobby.leave(&a1.handle).await.unwrap_err();
        assert_eq!(err, LobbyError::NotConnected);
        assert_eq!(err.code(), ErrorCode::Superseded);
        assert_eq!(
            h.lobby.join_queue(&a1.handle, Difficulty::Easy).await,
            Err(LobbyError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_outside_match_rejected() {
        let h = harness(MatchmakingConfig::default()).await;
        let (a, _rx) = connect(&h, "alice").await;
        assert_eq!(
            h.lobby.submit_input(&a.handle, PaddleDirection::Up).await,
            Err(LobbyError::NotInMatch)
        );
    }
}

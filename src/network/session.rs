//! Match Session Management
//!
//! Every live match is a [`MatchSession`] owned by its own driver task. The
//! driver runs the fixed-rate authoritative loop and is the only code that
//! touches the game state; everyone else talks to it through a
//! [`SessionCommand`] channel held by the [`SessionManager`].
//!
//! ```text
//!            submit_input / terminate / disconnect / reconnect
//!   Lobby ───────────────────────────────────────────────┐
//!                                                        ▼
//!   SessionManager ── table: SessionId → command sender ── driver task
//!                                                        │  tick, broadcast
//!                                                        ▼
//!                                       EventBroadcaster ── connections
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::rng::derive_session_seed;
use crate::game::events::GameEvent;
use crate::game::input::PaddleDirection;
use crate::game::state::{InvariantViolation, PlayerId, PongState, Side};
use crate::game::tick::{tick, GameConfig, TickResult};
use crate::network::broadcast::EventBroadcaster;
use crate::network::protocol::{MatchEndedInfo, MatchFoundInfo, ServerMessage, StateUpdate};
use crate::network::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::persistence::{Identity, MatchResult, PersistenceGateway, TerminationReason};
use crate::{TICK_RATE, WIN_SCORE};

/// Commands buffered per session before senders see backpressure.
const COMMAND_BUFFER: usize = 256;

/// Unique session identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short tag for logs
        f.write_str(&hex::encode(&self.as_bytes()[..4]))
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Configuration for match sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// Points needed to win.
    pub win_score: u32,
    /// How long a disconnected player may take to come back.
    pub grace: Duration,
    /// Ticks the ball rests before each serve.
    pub serve_delay_ticks: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate: TICK_RATE,
            win_score: WIN_SCORE,
            grace: Duration::from_secs(30),
            serve_delay_ticks: TICK_RATE,
        }
    }
}

impl SessionConfig {
    /// Load from environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let tick_rate = env_parse("GRIS_TICK_RATE")
            .filter(|rate| *rate > 0)
            .unwrap_or(defaults.tick_rate);

        Self {
            tick_rate,
            win_score: env_parse("GRIS_WIN_SCORE")
                .filter(|score| *score > 0)
                .unwrap_or(defaults.win_score),
            grace: env_parse("GRIS_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.grace),
            // One second of rest before each serve
            serve_delay_ticks: tick_rate,
        }
    }

    /// Simulation rules for one match.
    pub fn game_config(&self) -> GameConfig {
        GameConfig {
            tick_rate: self.tick_rate,
            win_score: self.win_score,
            serve_delay_ticks: self.serve_delay_ticks,
        }
    }

    /// Wall-clock length of one tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// =============================================================================
// MATCH SESSION
// =============================================================================

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Both players connected, ticking.
    Active,
    /// At least one player gone; the game is frozen.
    Paused,
    /// Terminal.
    Finished,
}

/// Commands the driver accepts.
#[derive(Debug)]
pub enum SessionCommand {
    /// New paddle intent.
    Input {
        player: PlayerId,
        direction: PaddleDirection,
    },
    /// A player's connection closed.
    Disconnected {
        player: PlayerId,
        conn_id: ConnectionId,
    },
    /// A player came back on a new connection.
    Reconnect { handle: ConnectionHandle },
    /// End the session now. Replies whether this call finished it.
    Terminate {
        reason: TerminationReason,
        done: oneshot::Sender<bool>,
    },
    /// Server stopping: exit without recording a result.
    Shutdown,
}

/// A player slot.
#[derive(Debug)]
struct Slot {
    identity: Identity,
    handle: Option<ConnectionHandle>,
    intent: PaddleDirection,
    grace_deadline: Option<Instant>,
}

impl Slot {
    fn new(handle: ConnectionHandle) -> Self {
        Self {
            identity: handle.identity().clone(),
            handle: Some(handle),
            intent: PaddleDirection::Stop,
            grace_deadline: None,
        }
    }
}

/// A live two-player match. Owned by its driver.
#[derive(Debug)]
pub struct MatchSession {
    id: SessionId,
    status: SessionStatus,
    config: SessionConfig,
    game_config: GameConfig,
    /// Left = earlier arrival.
    slots: [Slot; 2],
    state: PongState,
    started_at: Instant,
}

impl MatchSession {
    /// Create a session; `left` arrived first.
    pub fn new(
        id: SessionId,
        left: ConnectionHandle,
        right: ConnectionHandle,
        config: SessionConfig,
        now: Instant,
    ) -> Self {
        let seed = derive_session_seed(id.as_bytes(), &[left.player_id().0, right.player_id().0]);
        let game_config = config.game_config();
        let state = PongState::new(seed, game_config.serve_delay_ticks);

        Self {
            id,
            status: SessionStatus::Active,
            config,
            game_config,
            slots: [Slot::new(left), Slot::new(right)],
            state,
            started_at: now,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn state(&self) -> &PongState {
        &self.state
    }

    /// Players in slot order.
    pub fn players(&self) -> [PlayerId; 2] {
        [
            self.slots[0].identity.player_id,
            self.slots[1].identity.player_id,
        ]
    }

    pub fn side_of(&self, player: PlayerId) -> Option<Side> {
        Side::BOTH
            .into_iter()
            .find(|side| self.slots[side.index()].identity.player_id == player)
    }

    pub fn is_connected(&self, side: Side) -> bool {
        self.slots[side.index()].handle.is_some()
    }

    pub fn handle(&self, side: Side) -> Option<&ConnectionHandle> {
        self.slots[side.index()].handle.as_ref()
    }

    pub fn connected_handles(&self) -> Vec<ConnectionHandle> {
        self.slots.iter().filter_map(|s| s.handle.clone()).collect()
    }

    /// Current paddle intents in slot order.
    pub fn intents(&self) -> [PaddleDirection; 2] {
        [self.slots[0].intent, self.slots[1].intent]
    }

    /// Record a new intent from a connected player.
    pub fn set_intent(&mut self, player: PlayerId, direction: PaddleDirection) -> bool {
        if self.status == SessionStatus::Finished {
            return false;
        }
        match self.side_of(player) {
            Some(side) if self.is_connected(side) => {
                self.slots[side.index()].intent = direction;
                true
            }
            _ => false,
        }
    }

    /// Drop a player's connection and pause, arming the grace timer.
    ///
    /// Ignored unless `conn_id` is the connection currently in the slot.
    pub fn mark_disconnected(&mut self, player: PlayerId, conn_id: ConnectionId, now: Instant) -> bool {
        if self.status == SessionStatus::Finished {
            return false;
        }
        let Some(side) = self.side_of(player) else {
            return false;
        };
        let slot = &mut self.slots[side.index()];
        if !slot.handle.as_ref().is_some_and(|h| h.conn_id() == conn_id) {
            return false;
        }

        slot.handle = None;
        slot.intent = PaddleDirection::Stop;
        slot.grace_deadline = Some(now + self.config.grace);
        self.status = SessionStatus::Paused;
        true
    }

    /// Whether `handle` may take its player's slot right now.
    ///
    /// An empty slot accepts it until the grace deadline. A slot still
    /// holding an older connection for the same player accepts it at once,
    /// since the registry only lets the newest connection through.
    pub fn can_resume(&self, handle: &ConnectionHandle, now: Instant) -> bool {
        if self.status == SessionStatus::Finished {
            return false;
        }
        let Some(side) = self.side_of(handle.player_id()) else {
            return false;
        };
        let slot = &self.slots[side.index()];
        match &slot.handle {
            Some(current) => current.conn_id() < handle.conn_id(),
            None => slot.grace_deadline.is_some_and(|deadline| now < deadline),
        }
    }

    /// Put a returning player's connection in their slot, replacing any
    /// older one. Resumes once both sides are connected.
    pub fn resume(&mut self, handle: ConnectionHandle, now: Instant) -> Option<Side> {
        if !self.can_resume(&handle, now) {
            return None;
        }
        let side = self.side_of(handle.player_id())?;
        let slot = &mut self.slots[side.index()];
        slot.handle = Some(handle);
        slot.intent = PaddleDirection::Stop;
        slot.grace_deadline = None;

        if Side::BOTH.iter().all(|s| self.is_connected(*s)) {
            self.status = SessionStatus::Active;
        }
        Some(side)
    }

    /// Earliest pending grace deadline.
    pub fn next_grace_deadline(&self) -> Option<(Instant, Side)> {
        Side::BOTH
            .into_iter()
            .filter_map(|side| self.slots[side.index()].grace_deadline.map(|at| (at, side)))
            .min_by_key(|(at, side)| (*at, side.index()))
    }

    /// Slot whose grace ran out by `now`.
    pub fn expired_slot(&self, now: Instant) -> Option<Side> {
        self.next_grace_deadline()
            .filter(|(at, _)| *at <= now)
            .map(|(_, side)| side)
    }

    /// Advance one tick. No-op unless Active.
    pub fn run_tick(&mut self) -> Result<TickResult, InvariantViolation> {
        if self.status != SessionStatus::Active {
            return Ok(TickResult::default());
        }
        let intents = self.intents();
        let result = tick(&mut self.state, &intents, &self.game_config);
        self.state.check_invariants(self.game_config.win_score)?;
        Ok(result)
    }

    /// Current state as a client message.
    pub fn state_update(&self, events: Vec<GameEvent>) -> ServerMessage {
        ServerMessage::StateUpdate(StateUpdate::from_state(self.id, &self.state, events))
    }

    /// `MatchFound` for the player on `side`.
    pub fn match_found(&self, side: Side, resumed: bool) -> ServerMessage {
        ServerMessage::MatchFound(MatchFoundInfo {
            session_id: self.id,
            side,
            opponent: self.slots[side.opponent().index()].identity.clone(),
            win_score: self.game_config.win_score,
            tick_rate: self.game_config.tick_rate,
            resumed,
        })
    }

    /// Winner for a termination reason.
    ///
    /// A walk-away loses; otherwise the leader wins and a tie goes left.
    fn winner_for(&self, reason: &TerminationReason) -> Side {
        let forfeiter = reason
            .forfeiting_player()
            .and_then(|player| self.side_of(player));
        match (reason, forfeiter) {
            (_, Some(side)) => side.opponent(),
            (TerminationReason::Completed, None) => self
                .state
                .winner()
                .or_else(|| self.state.leader())
                .unwrap_or(Side::Left),
            _ => self.state.leader().unwrap_or(Side::Left),
        }
    }

    /// Build the final result.
    pub fn build_result(&self, reason: TerminationReason, now: Instant) -> MatchResult {
        let winner = self.winner_for(&reason);
        let duration = now.saturating_duration_since(self.started_at);
        MatchResult::from_slots(
            self.id,
            self.players(),
            self.state.score,
            winner,
            self.state.tick,
            duration.as_millis() as u64,
            reason,
        )
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No such live session.
    #[error("Session {0} not found")]
    NotFound(SessionId),

    /// Player is not part of the session.
    #[error("Player {0} is not in this session")]
    NotInSession(PlayerId),

    /// A player left before the session could start.
    #[error("Players no longer available")]
    PlayersUnavailable,

    /// Session is shutting down.
    #[error("Session {0} is closed")]
    Closed(SessionId),
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

struct SessionEntry {
    commands: mpsc::Sender<SessionCommand>,
    players: [PlayerId; 2],
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, SessionEntry>,
    by_player: HashMap<PlayerId, SessionId>,
}

enum DriverExit {
    Finished {
        reason: TerminationReason,
        done: Option<oneshot::Sender<bool>>,
    },
    Shutdown,
}

/// Manages all live sessions.
pub struct SessionManager {
    table: RwLock<SessionTable>,
    config: SessionConfig,
    registry: Arc<ConnectionRegistry>,
    gateway: Arc<dyn PersistenceGateway>,
    broadcaster: EventBroadcaster,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        registry: Arc<ConnectionRegistry>,
        gateway: Arc<dyn PersistenceGateway>,
        broadcaster: EventBroadcaster,
    ) -> Self {
        Self {
            table: RwLock::new(SessionTable::default()),
            config,
            registry,
            gateway,
            broadcaster,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a session for two connections and start its driver.
    ///
    /// Both players move to InSession atomically; if either is no longer
    /// available nothing is created.
    pub async fn create_session(
        self: &Arc<Self>,
        left: ConnectionHandle,
        right: ConnectionHandle,
    ) -> Result<SessionId, SessionError> {
        let id = SessionId::new();
        let players = [left.player_id(), right.player_id()];
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        {
            let mut table = self.table.write().await;
            if players.iter().any(|p| table.by_player.contains_key(p)) {
                return Err(SessionError::PlayersUnavailable);
            }
            table.sessions.insert(id, SessionEntry { commands: tx, players });
            for player in players {
                table.by_player.insert(player, id);
            }
        }

        if !self.registry.begin_session(&left, &right, id).await {
            self.remove(id).await;
            debug!("Session {} discarded, {} or {} unavailable", id, players[0], players[1]);
            return Err(SessionError::PlayersUnavailable);
        }

        let session = MatchSession::new(id, left, right, self.config.clone(), Instant::now());
        info!("Session {} created: {} vs {}", id, players[0], players[1]);
        tokio::spawn(Arc::clone(self).drive(session, rx));

        Ok(id)
    }

    /// Forward a paddle intent to a session.
    pub async fn submit_input(
        &self,
        id: SessionId,
        player: PlayerId,
        direction: PaddleDirection,
    ) -> Result<(), SessionError> {
        let commands = self.commands_for(id, Some(player)).await?;
        match commands.try_send(SessionCommand::Input { player, direction }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Intents are idempotent; the next one supersedes this
                debug!("Session {} command buffer full, input from {} dropped", id, player);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::Closed(id)),
        }
    }

    /// Tell a session a player's connection closed.
    pub async fn player_disconnected(&self, id: SessionId, player: PlayerId, conn_id: ConnectionId) {
        if let Ok(commands) = self.commands_for(id, Some(player)).await {
            let _ = commands.send(SessionCommand::Disconnected { player, conn_id }).await;
        }
    }

    /// Hand a returning player's new connection to their session.
    pub async fn reconnect(&self, id: SessionId, handle: ConnectionHandle) -> bool {
        match self.commands_for(id, Some(handle.player_id())).await {
            Ok(commands) => commands.send(SessionCommand::Reconnect { handle }).await.is_ok(),
            Err(_) => false,
        }
    }

    /// End a session. Idempotent: returns `true` only for the call that
    /// actually finished it.
    pub async fn terminate(&self, id: SessionId, reason: TerminationReason) -> bool {
        let Ok(commands) = self.commands_for(id, None).await else {
            return false;
        };
        let (done, finished) = oneshot::channel();
        if commands.send(SessionCommand::Terminate { reason, done }).await.is_err() {
            return false;
        }
        finished.await.unwrap_or(false)
    }

    /// Live session a player belongs to.
    pub async fn session_for(&self, player: PlayerId) -> Option<SessionId> {
        self.table.read().await.by_player.get(&player).copied()
    }

    pub async fn session_count(&self) -> usize {
        self.table.read().await.sessions.len()
    }

    /// Stop every driver without recording results.
    pub async fn shutdown_all(&self) {
        let senders: Vec<_> = self
            .table
            .read()
            .await
            .sessions
            .values()
            .map(|entry| entry.commands.clone())
            .collect();
        for commands in senders {
            let _ = commands.send(SessionCommand::Shutdown).await;
        }
    }

    async fn commands_for(
        &self,
        id: SessionId,
        player: Option<PlayerId>,
    ) -> Result<mpsc::Sender<SessionCommand>, SessionError> {
        let table = self.table.read().await;
        let entry = table.sessions.get(&id).ok_or(SessionError::NotFound(id))?;
        if let Some(player) = player {
            if !entry.players.contains(&player) {
                return Err(SessionError::NotInSession(player));
            }
        }
        Ok(entry.commands.clone())
    }

    async fn remove(&self, id: SessionId) {
        let mut table = self.table.write().await;
        if let Some(entry) = table.sessions.remove(&id) {
            for player in entry.players {
                if table.by_player.get(&player) == Some(&id) {
                    table.by_player.remove(&player);
                }
            }
        }
    }

    // ===== DRIVER =====

    async fn drive(self: Arc<Self>, mut session: MatchSession, mut rx: mpsc::Receiver<SessionCommand>) {
        for side in Side::BOTH {
            if let Some(handle) = session.handle(side) {
                self.broadcaster.send(handle, session.match_found(side, false));
            }
        }
        self.broadcaster
            .publish(&session.connected_handles(), session.state_update(Vec::new()));

        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; tick 1 is one period away
        interval.tick().await;

        let exit = loop {
            let deadline = session.next_grace_deadline();
            let wake_at = deadline
                .map(|(at, _)| at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            let outcome = tokio::select! {
                _ = interval.tick(), if session.status() == SessionStatus::Active => {
                    self.on_tick(&mut session, &mut rx).await
                }
                command = rx.recv() => match command {
                    Some(command) => self.on_command(&mut session, command).await,
                    None => Some(DriverExit::Shutdown),
                },
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    session.expired_slot(Instant::now()).map(|side| DriverExit::Finished {
                        reason: TerminationReason::GraceExpired {
                            player: session.players()[side.index()],
                        },
                        done: None,
                    })
                }
            };

            if let Some(exit) = outcome {
                break exit;
            }
        };

        match exit {
            DriverExit::Finished { reason, done } => self.finish(session, rx, reason, done).await,
            DriverExit::Shutdown => self.close(session, rx).await,
        }
    }

    /// One tick boundary: drain queued commands, step, broadcast.
    async fn on_tick(
        &self,
        session: &mut MatchSession,
        rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> Option<DriverExit> {
        while let Ok(command) = rx.try_recv() {
            if let Some(exit) = self.on_command(session, command).await {
                return Some(exit);
            }
        }
        // A drained disconnect may have paused the game
        if session.status() != SessionStatus::Active {
            return None;
        }

        let result = match session.run_tick() {
            Ok(result) => result,
            Err(violation) => {
                error!("Session {} broke an invariant: {}", session.id(), violation);
                return Some(DriverExit::Finished {
                    reason: TerminationReason::Fatal {
                        detail: violation.to_string(),
                    },
                    done: None,
                });
            }
        };

        if let Some(scorer) = result.scored {
            debug!(
                "Session {} point to {:?}, score {:?}",
                session.id(),
                scorer,
                session.state().score
            );
        }

        let match_ended = result.match_ended;
        self.broadcaster
            .publish(&session.connected_handles(), session.state_update(result.events));

        match_ended.then_some(DriverExit::Finished {
            reason: TerminationReason::Completed,
            done: None,
        })
    }

    async fn on_command(&self, session: &mut MatchSession, command: SessionCommand) -> Option<DriverExit> {
        match command {
            SessionCommand::Input { player, direction } => {
                session.set_intent(player, direction);
                None
            }
            SessionCommand::Disconnected { player, conn_id } => {
                self.on_disconnected(session, player, conn_id);
                None
            }
            SessionCommand::Reconnect { handle } => {
                self.on_reconnect(session, handle).await;
                None
            }
            SessionCommand::Terminate { reason, done } => Some(DriverExit::Finished {
                reason,
                done: Some(done),
            }),
            SessionCommand::Shutdown => Some(DriverExit::Shutdown),
        }
    }

    fn on_disconnected(&self, session: &mut MatchSession, player: PlayerId, conn_id: ConnectionId) {
        if !session.mark_disconnected(player, conn_id, Instant::now()) {
            return;
        }
        info!("Session {} paused, player {} disconnected", session.id(), player);
        self.broadcaster.publish(
            &session.connected_handles(),
            ServerMessage::SessionPaused {
                session_id: session.id(),
                player_id: player,
                grace_ms: self.config.grace.as_millis() as u64,
            },
        );
    }

    async fn on_reconnect(&self, session: &mut MatchSession, handle: ConnectionHandle) {
        let player = handle.player_id();
        let Some(side) = session.side_of(player) else {
            return;
        };
        if !session.can_resume(&handle, Instant::now()) {
            debug!("Session {} cannot resume player {}", session.id(), player);
            return;
        }
        let previous = session.handle(side).map(|h| h.conn_id());

        // Registry moves the new connection Idle -> InSession; a stale
        // handle loses here
        if !self.registry.attach_session(&handle, session.id()).await {
            debug!("Session {} resume by {} lost a race", session.id(), handle.conn_id());
            // Something newer than the slot's connection registered, so that one is gone
            if let Some(previous) = previous {
                self.on_disconnected(session, player, previous);
            }
            return;
        }
        let Some(side) = session.resume(handle.clone(), Instant::now()) else {
            return;
        };

        info!("Session {} player {} resumed on {}", session.id(), player, handle.conn_id());
        self.broadcaster.send(&handle, session.match_found(side, true));
        self.broadcaster.send(&handle, session.state_update(Vec::new()));
        // A swap between live connections is invisible to the opponent
        if previous.is_some() {
            return;
        }
        if let Some(opponent) = session.handle(side.opponent()) {
            self.broadcaster.send(
                opponent,
                ServerMessage::SessionResumed {
                    session_id: session.id(),
                    player_id: player,
                },
            );
        }
    }

    /// Record, notify, release. Runs once per session.
    async fn finish(
        &self,
        mut session: MatchSession,
        mut rx: mpsc::Receiver<SessionCommand>,
        reason: TerminationReason,
        done: Option<oneshot::Sender<bool>>,
    ) {
        session.status = SessionStatus::Finished;
        rx.close();

        let result = session.build_result(reason, Instant::now());
        if let Err(e) = self.gateway.record_match_result(&result).await {
            warn!("Session {} result not recorded: {}", session.id(), e);
        }

        self.broadcaster.publish(
            &session.connected_handles(),
            ServerMessage::MatchEnded(MatchEndedInfo::from(&result)),
        );

        self.remove(session.id()).await;
        for player in session.players() {
            self.registry.release_session(player, session.id()).await;
        }

        info!(
            "Session {} finished: {} beat {} {} ({:?}, {} ticks)",
            session.id(),
            result.winner_id,
            result.loser_id,
            result.score_line(),
            result.reason,
            result.ticks
        );

        if let Some(done) = done {
            let _ = done.send(true);
        }
        reject_pending(&mut rx);
    }

    /// Leave without a result (server shutdown).
    async fn close(&self, mut session: MatchSession, mut rx: mpsc::Receiver<SessionCommand>) {
        session.status = SessionStatus::Finished;
        rx.close();
        self.remove(session.id()).await;
        for player in session.players() {
            self.registry.release_session(player, session.id()).await;
        }
        debug!("Session {} closed for shutdown", session.id());
        reject_pending(&mut rx);
    }
}

/// Answer terminate calls that raced with the end of the session.
fn reject_pending(rx: &mut mpsc::Receiver<SessionCommand>) {
    while let Ok(command) = rx.try_recv() {
        if let SessionCommand::Terminate { done, .. } = command {
            let _ = done.send(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::core::fixed::{FIXED_ONE, MAX_BALL_SPEED};
    use crate::game::state::MatchPhase;
    use crate::network::registry::ConnectionState;
    use crate::persistence::{Identity, MatchResult, PersistenceError};
    use crate::network::registry::tests::identity;
    use crate::persistence::MemoryStore;

    struct Harness {
        manager: Arc<SessionManager>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        async fn new(config: SessionConfig) -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let store = Arc::new(MemoryStore::new());
            let manager = Arc::new(SessionManager::new(
                config,
                Arc::clone(&registry),
                store.clone(),
                EventBroadcaster::new(),
            ));
            Self { manager, registry, store }
        }

        async fn player(&self, name: &str) -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
            let identity = match self.store.get_user_identity(name).await.unwrap() {
                Some(identity) => identity,
                None => self.store.create_user(name, name, "HACKTIVISTS").await.unwrap(),
            };
            let (tx, rx) = mpsc::channel(8192);
            let registration = self.registry.register(identity, tx).await;
            (registration.handle, rx)
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            grace: Duration::from_secs(5),
            serve_delay_ticks: 10,
            ..SessionConfig::default()
        }
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

    fn is_match_ended(msg: &ServerMessage) -> bool {
        matches!(msg, ServerMessage::MatchEnded(_))
    }

    fn handle(id: u64) -> ConnectionHandle {
        handle_for(id, id)
    }

    fn handle_for(conn: u64, player: u64) -> ConnectionHandle {
        let (tx, _rx) = mpsc::channel(10);
        ConnectionHandle::new(ConnectionId(conn), identity(player), tx)
    }

    // ===== MatchSession =====

    #[tokio::test]
    async fn test_pause_and_resume() {
        let now = Instant::now();
        let (a, b) = (handle(1), handle(2));
        let mut session = MatchSession::new(SessionId::new(), a, b.clone(), test_config(), now);

        // Stale connection id is ignored
        assert!(!session.mark_disconnected(PlayerId(2), ConnectionId(99), now));
        assert!(session.mark_disconnected(PlayerId(2), b.conn_id(), now));
        assert_eq!(session.status(), SessionStatus::Paused);
        assert!(!session.is_connected(Side::Right));

        let tick_before = session.state().tick;
        session.run_tick().unwrap();
        assert_eq!(session.state().tick, tick_before);

        let back = handle(2);
        assert_eq!(session.resume(back, now + Duration::from_secs(1)), Some(Side::Right));
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(session.next_grace_deadline().is_none());
    }

    #[tokio::test]
    async fn test_resume_after_grace_refused() {
        let now = Instant::now();
        let b = handle(2);
        let mut session = MatchSession::new(SessionId::new(), handle(1), b.clone(), test_config(), now);
        session.mark_disconnected(PlayerId(2), b.conn_id(), now);

        let late = now + Duration::from_secs(5);
        assert!(!session.can_resume(&handle(2), late));
        assert_eq!(session.expired_slot(late), Some(Side::Right));
        assert!(session.resume(handle(2), late).is_none());
    }

    #[tokio::test]
    async fn test_input_ignored_from_strangers_and_disconnected() {
        let now = Instant::now();
        let b = handle(2);
        let mut session = MatchSession::new(SessionId::new(), handle(1), b.clone(), test_config(), now);

        assert!(session.set_intent(PlayerId(1), PaddleDirection::Up));
        assert!(!session.set_intent(PlayerId(3), PaddleDirection::Up));

        session.mark_disconnected(PlayerId(2), b.conn_id(), now);
        assert!(!session.set_intent(PlayerId(2), PaddleDirection::Down));
        assert_eq!(session.intents(), [PaddleDirection::Up, PaddleDirection::Stop]);
    }

    #[tokio::test]
    async fn test_winner_for_reasons() {
        let now = Instant::now();
        let mut session = MatchSession::new(SessionId::new(), handle(1), handle(2), test_config(), now);

        let fatal = TerminationReason::Fatal { detail: "boom".into() };
        // Tie goes left
        assert_eq!(session.build_result(fatal.clone(), now).winner_id, PlayerId(1));

        session.state.score = [1, 3];
        let result = session.build_result(fatal, now);
        assert_eq!(result.winner_id, PlayerId(2));
        assert_eq!(result.score_line(), "3-1");

        // Forfeit beats the scoreboard
        let result = session.build_result(TerminationReason::Forfeit { player: PlayerId(2) }, now);
        assert_eq!(result.winner_id, PlayerId(1));
        assert_eq!(result.loser_score, 3);
    }

    #[tokio::test]
    async fn test_invariant_violation_surfaces() {
        let now = Instant::now();
        let mut session = MatchSession::new(SessionId::new(), handle(1), handle(2), test_config(), now);
        // Still counting down to the serve, so the tick leaves velocity alone
        assert!(matches!(session.state.phase, MatchPhase::Serving { .. }));
        session.state.ball.velocity.x = MAX_BALL_SPEED + FIXED_ONE;

        assert!(matches!(session.run_tick(), Err(InvariantViolation::BallTooFast(_))));
    }

    #[tokio::test]
    async fn test_newer_connection_takes_over_live_slot() {
        let now = Instant::now();
        let b = handle_for(2, 2);
        let mut session = MatchSession::new(SessionId::new(), handle(1), b.clone(), test_config(), now);

        // Older connection for the same player cannot evict the current one
        assert!(!session.can_resume(&handle_for(1, 2), now));

        let b2 = handle_for(7, 2);
        assert!(session.can_resume(&b2, now));
        assert_eq!(session.resume(b2.clone(), now), Some(Side::Right));
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.handle(Side::Right).map(|h| h.conn_id()), Some(b2.conn_id()));

        // The replaced connection's close arrives late and changes nothing
        assert!(!session.mark_disconnected(PlayerId(2), b.conn_id(), now));
        assert!(session.is_connected(Side::Right));
        assert!(session.next_grace_deadline().is_none());
    }

    // ===== Driver =====

    #[tokio::test(start_paused = true)]
    async fn test_start_sends_match_found_and_tick_zero() {
        let h = Harness::new(test_config()).await;
        let (p1, mut rx1) = h.player("p1").await;
        let (p2, mut rx2) = h.player("p2").await;

        let sid = h.manager.create_session(p1.clone(), p2.clone()).await.unwrap();

        match rx1.recv().await {
            Some(ServerMessage::MatchFound(info)) => {
                assert_eq!(info.session_id, sid);
                assert_eq!(info.side, Side::Left);
                assert_eq!(info.opponent.player_id, p2.player_id());
            }
            other => panic!("expected match_found, got {:?}", other),
        }
        match rx2.recv().await {
            Some(ServerMessage::MatchFound(info)) => {
                assert_eq!(info.session_id, sid);
                assert_eq!(info.side, Side::Right);
                assert_eq!(info.opponent.username, "p1");
            }
            other => panic!("expected match_found, got {:?}", other),
        }
        match rx1.recv().await {
            Some(ServerMessage::StateUpdate(update)) => {
                assert_eq!(update.tick, 0);
                assert_eq!(update.score, [0, 0]);
            }
            other => panic!("expected state_update, got {:?}", other),
        }

        assert_eq!(h.manager.session_for(p1.player_id()).await, Some(sid));
        assert_eq!(
            h.registry.state_of(p2.player_id()).await,
            Some(crate::network::registry::ConnectionState::InSession(sid))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_is_idempotent() {
        let h = Harness::new(test_config()).await;
        let (p1, mut rx1) = h.player("p1").await;
        let (p2, _rx2) = h.player("p2").await;
        let sid = h.manager.create_session(p1.clone(), p2.clone()).await.unwrap();

        let reason = TerminationReason::Forfeit { player: p2.player_id() };
        assert!(h.manager.terminate(sid, reason.clone()).await);
        assert!(!h.manager.terminate(sid, reason).await);
        assert!(!h.manager.terminate(SessionId::new(), TerminationReason::Completed).await);

        let ended = next_where(&mut rx1, is_match_ended).await;
        if let ServerMessage::MatchEnded(info) = ended {
            assert_eq!(info.winner, p1.player_id());
        }
        let mut extra = 0;
        while let Ok(msg) = rx1.try_recv() {
            if is_match_ended(&msg) {
                extra += 1;
            }
        }
        assert_eq!(extra, 0);
        assert_eq!(h.store.history().await.len(), 1);
        assert_eq!(h.manager.session_count().await, 0);
        assert_eq!(
            h.registry.state_of(p1.player_id()).await,
            Some(crate::network::registry::ConnectionState::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_tick_ends_match_for_both() {
        let h = Harness::new(test_config()).await;
        let (p1, mut rx1) = h.player("p1").await;
        let (p2, mut rx2) = h.player("p2").await;
        let sid = SessionId::new();
        assert!(h.registry.begin_session(&p1, &p2, sid).await);

        let mut session = MatchSession::new(sid, p1.clone(), p2.clone(), test_config(), Instant::now());
        session.state.score = [2, 2];
        session.state.ball.velocity.x = -(MAX_BALL_SPEED + FIXED_ONE);
        let (_commands, mut rx) = mpsc::channel(COMMAND_BUFFER);

        let reason = match h.manager.on_tick(&mut session, &mut rx).await {
            Some(DriverExit::Finished { reason, done: None }) => reason,
            _ => panic!("expected the tick to end the session"),
        };
        assert!(matches!(reason, TerminationReason::Fatal { .. }));
        h.manager.finish(session, rx, reason, None).await;

        for rx in [&mut rx1, &mut rx2] {
            match next_where(rx, is_match_ended).await {
                ServerMessage::MatchEnded(info) => {
                    assert!(matches!(info.reason, TerminationReason::Fatal { .. }));
                    // Level score goes to the left slot
                    assert_eq!(info.winner, p1.player_id());
                    assert_eq!(info.score, "2-2");
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(h.store.history().await.len(), 1);
        for player in [p1.player_id(), p2.player_id()] {
            assert_eq!(h.registry.state_of(player).await, Some(ConnectionState::Idle));
        }
    }

    /// Storage that is down for writes.
    #[derive(Default)]
    struct UnavailableStore {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl PersistenceGateway for UnavailableStore {
        async fn record_match_result(&self, _result: &MatchResult) -> Result<(), PersistenceError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::Unavailable("connection refused".into()))
        }

        async fn get_user_identity(&self, _username: &str) -> Result<Option<Identity>, PersistenceError> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecorded_result_still_finishes() {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(UnavailableStore::default());
        let manager = Arc::new(SessionManager::new(
            test_config(),
            Arc::clone(&registry),
            store.clone(),
            EventBroadcaster::new(),
        ));
        let (tx1, mut rx1) = mpsc::channel(8192);
        let (tx2, mut rx2) = mpsc::channel(8192);
        let p1 = registry.register(identity(1), tx1).await.handle;
        let p2 = registry.register(identity(2), tx2).await.handle;
        let sid = manager.create_session(p1.clone(), p2.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(manager.terminate(sid, TerminationReason::Forfeit { player: p1.player_id() }).await);

        for rx in [&mut rx1, &mut rx2] {
            match next_where(rx, is_match_ended).await {
                ServerMessage::MatchEnded(info) => assert_eq!(info.winner, p2.player_id()),
                _ => unreachable!(),
            }
        }
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.session_count().await, 0);
        assert_eq!(manager.session_for(p1.player_id()).await, None);
        for player in [p1.player_id(), p2.player_id()] {
            assert_eq!(registry.state_of(player).await, Some(ConnectionState::Idle));
        }

        // Both can be paired again
        assert!(manager.create_session(p2, p1).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_forfeits() {
        let h = Harness::new(test_config()).await;
        let (p1, mut rx1) = h.player("p1").await;
        let (p2, _rx2) = h.player("p2").await;
        let sid = h.manager.create_session(p1.clone(), p2.clone()).await.unwrap();

        h.manager.player_disconnected(sid, p2.player_id(), p2.conn_id()).await;

        let paused = next_where(&mut rx1, |m| matches!(m, ServerMessage::SessionPaused { .. })).await;
        assert_eq!(paused.session_id(), Some(sid));

        let started = Instant::now();
        match next_where(&mut rx1, is_match_ended).await {
            ServerMessage::MatchEnded(info) => {
                assert_eq!(info.winner, p1.player_id());
                assert_eq!(info.reason, TerminationReason::GraceExpired { player: p2.player_id() });
            }
            _ => unreachable!(),
        }
        assert!(started.elapsed() >= Duration::from_secs(4));

        let history = h.store.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].winner_id, p1.player_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_resumes_same_session() {
        let h = Harness::new(test_config()).await;
        let (p1, mut rx1) = h.player("p1").await;
        let (p2, _rx2) = h.player("p2").await;
        let sid = h.manager.create_session(p1.clone(), p2.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        h.manager.player_disconnected(sid, p2.player_id(), p2.conn_id()).await;

        // Last tick P1 saw before the pause
        let mut last_tick = 0;
        loop {
            match rx1.recv().await.unwrap() {
                ServerMessage::StateUpdate(update) => last_tick = update.tick,
                ServerMessage::SessionPaused { .. } => break,
                _ => {}
            }
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        let (p2_back, mut rx2_back) = h.player("p2").await;
        assert!(h.manager.reconnect(sid, p2_back.clone()).await);

        match rx2_back.recv().await.unwrap() {
            ServerMessage::MatchFound(info) => {
                assert!(info.resumed);
                assert_eq!(info.session_id, sid);
            }
            other => panic!("expected match_found, got {:?}", other),
        }
        match rx2_back.recv().await.unwrap() {
            ServerMessage::StateUpdate(update) => assert_eq!(update.tick, last_tick),
            other => panic!("expected state_update, got {:?}", other),
        }
        next_where(&mut rx1, |m| matches!(m, ServerMessage::SessionResumed { .. })).await;

        // Ticking again
        let update = next_where(&mut rx1, |m| matches!(m, ServerMessage::StateUpdate(_))).await;
        if let ServerMessage::StateUpdate(update) = update {
            assert!(update.tick > last_tick);
        }
        assert!(h.store.history().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_fails_when_player_gone() {
        let h = Harness::new(test_config()).await;
        let (p1, _rx1) = h.player("p1").await;
        let (p2, _rx2) = h.player("p2").await;
        h.registry.unregister(&p2).await;

        let result = h.manager.create_session(p1.clone(), p2).await;

        assert_eq!(result, Err(SessionError::PlayersUnavailable));
        assert_eq!(h.manager.session_count().await, 0);
        assert!(h.manager.session_for(p1.player_id()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_player_wins_to_five() {
        let h = Harness::new(test_config()).await;
        let (p1, mut rx1) = h.player("p1").await;
        let (p2, mut rx2) = h.player("p2").await;
        let sid = h.manager.create_session(p1.clone(), p2.clone()).await.unwrap();

        h.manager.submit_input(sid, p2.player_id(), PaddleDirection::Up).await.unwrap();
        let p2_view = tokio::spawn(async move { next_where(&mut rx2, is_match_ended).await });

        let mut current = PaddleDirection::Stop;
        let ended = tokio::time::timeout(Duration::from_secs(3600), async {
            loop {
                match rx1.recv().await.unwrap() {
                    ServerMessage::StateUpdate(update) => {
                        let wanted = PaddleDirection::toward(update.paddles[0], update.ball[1], FIXED_ONE / 2);
                        if wanted != current {
                            current = wanted;
                            let _ = h.manager.submit_input(sid, p1.player_id(), wanted).await;
                        }
                    }
                    msg @ ServerMessage::MatchEnded(_) => break msg,
                    _ => {}
                }
            }
        })
        .await
        .expect("match did not finish");

        let ServerMessage::MatchEnded(info) = ended else { unreachable!() };
        assert_eq!(info.winner, p1.player_id());
        assert!(info.score.starts_with("5-"));
        assert_eq!(info.reason, TerminationReason::Completed);

        assert_eq!(p2_view.await.unwrap(), ServerMessage::MatchEnded(info));
        assert_eq!(h.store.history().await.len(), 1);
        let stats = h.store.stats(p1.player_id()).await.unwrap();
        assert_eq!(stats.wins, 1);
    }
}

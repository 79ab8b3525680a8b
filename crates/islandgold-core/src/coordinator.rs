//! Server-authoritative match state machine.
//!
//! A [`Coordinator`] owns one [`Match`] and is its only writer. Every
//! operation is a synchronous state transition that queues the messages it
//! derives into an outbox; the host drains the outbox after each call and
//! delivers the messages to the named recipients. Callers must serialize all
//! operations for one match (one actor per match); nothing here locks.

use std::collections::BTreeSet;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::config::{MatchConfig, ResetPhase, StartPolicy};
use crate::match_state::{Match, MatchPhase, MatchSnapshot};
use crate::net::messages::{
    LobbyUpdateMsg, MatchOverMsg, MatchResetMsg, MatchStartedMsg, PlayerJoinedMsg,
    PlayerLeftMsg, PlayerMovedMsg, ServerMessage, SnapshotMsg, TimeUpdateMsg,
    TreasureCollectedMsg, validate_display_name,
};
use crate::player::{ConnectionId, Player, PlayerId, Pose};
use crate::treasure::{Treasure, TreasureId, generate_treasures};

/// Who an outbound message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    All,
    AllExcept(ConnectionId),
    Only(ConnectionId),
}

impl Recipients {
    pub fn includes(self, conn: ConnectionId) -> bool {
        match self {
            Self::All => true,
            Self::AllExcept(excluded) => excluded != conn,
            Self::Only(target) => target == conn,
        }
    }
}

/// A message produced by a coordinator operation, not yet delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: Recipients,
    pub message: ServerMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("invalid display name: {0}")]
    InvalidName(String),
}

/// Why a mutation was dropped. Rejections are never sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("match is not running")]
    NotRunning,
    #[error("match has ended")]
    MatchEnded,
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("unknown treasure {0}")]
    UnknownTreasure(TreasureId),
    #[error("treasure already collected by player {by}")]
    AlreadyCollected { by: PlayerId },
    #[error("stale generation {got}, current is {expected}")]
    StaleGeneration { expected: u64, got: u64 },
    #[error("match is not in the lobby")]
    NotInLobby,
}

/// Result of a successful collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectReceipt {
    pub treasure_id: TreasureId,
    pub collector_id: PlayerId,
    pub points: u32,
    pub new_score: u32,
}

/// What a call to [`Coordinator::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Clock not running (Lobby, or Ended waiting for a reset).
    Idle,
    /// Clock advanced; seconds left.
    Counting(u32),
    /// This tick ran the clock out.
    Ended,
    /// The post-match pause elapsed and a new generation began.
    Reset,
}

pub struct Coordinator {
    config: MatchConfig,
    state: Match,
    rng: StdRng,
    outbox: Vec<Outbound>,
    next_joined_order: u64,
    /// Ticks observed since the match entered Ended.
    ended_ticks: u32,
    match_over_sent: bool,
    ready: BTreeSet<PlayerId>,
}

impl Coordinator {
    /// Create a coordinator for a fresh match. `config` is assumed to have
    /// passed [`MatchConfig::validate`].
    pub fn new(config: MatchConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    pub fn with_rng(config: MatchConfig, mut rng: StdRng) -> Self {
        let treasures = generate_treasures(&mut rng, &config, 1);
        Self::build(config, rng, treasures)
    }

    /// Create a coordinator whose first generation uses exactly `treasures`.
    /// Later generations are drawn from the configured tiers as usual.
    pub fn with_treasures(config: MatchConfig, treasures: Vec<Treasure>) -> Self {
        Self::build(config, StdRng::from_os_rng(), treasures)
    }

    fn build(config: MatchConfig, rng: StdRng, treasures: Vec<Treasure>) -> Self {
        let phase = match config.start_policy {
            StartPolicy::Immediate => MatchPhase::Running,
            StartPolicy::FirstJoin | StartPolicy::FirstReady => MatchPhase::Lobby,
        };
        let state = Match::new(1, phase, config.duration_secs, treasures);
        Self {
            config,
            state,
            rng,
            outbox: Vec::new(),
            next_joined_order: 0,
            ended_ticks: 0,
            match_over_sent: false,
            ready: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn state(&self) -> &Match {
        &self.state
    }

    pub fn phase(&self) -> MatchPhase {
        self.state.phase
    }

    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    pub fn time_remaining(&self) -> u32 {
        self.state.time_remaining
    }

    pub fn player_count(&self) -> usize {
        self.state.players.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn snapshot(&self) -> MatchSnapshot {
        self.state.snapshot()
    }

    /// Take every message queued since the last drain, in emission order.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    fn emit(&mut self, to: Recipients, message: ServerMessage) {
        self.outbox.push(Outbound { to, message });
    }

    /// Register a player for `conn` at the spawn pose with score 0.
    ///
    /// The other connections are told about the newcomer and the newcomer
    /// alone receives the full snapshot.
    pub fn join(&mut self, conn: ConnectionId, display_name: &str) -> Result<Player, JoinError> {
        if self.state.players.contains_key(&conn) {
            warn!(conn_id = conn, "Duplicate join for registered connection");
            return Err(JoinError::DuplicateConnection(conn));
        }
        let name =
            validate_display_name(display_name).map_err(|e| JoinError::InvalidName(e.to_string()))?;

        let player = Player::new(conn, name, self.config.spawn, self.next_joined_order);
        self.next_joined_order += 1;
        self.state.players.insert(conn, player.clone());

        self.emit(
            Recipients::AllExcept(conn),
            ServerMessage::PlayerJoined(PlayerJoinedMsg {
                player: player.clone(),
            }),
        );
        self.emit(
            Recipients::Only(conn),
            ServerMessage::Snapshot(Box::new(SnapshotMsg {
                your_id: conn,
                snapshot: self.state.snapshot(),
            })),
        );
        info!(
            player_id = conn,
            name = %player.display_name,
            players = self.state.players.len(),
            "Player joined"
        );

        self.maybe_start();
        self.emit_lobby_update();
        Ok(player)
    }

    /// Remove the player for `conn`. Returns false if there was none.
    pub fn leave(&mut self, conn: ConnectionId) -> bool {
        let Some(player) = self.state.players.remove(&conn) else {
            debug!(conn_id = conn, "Leave for unknown connection ignored");
            return false;
        };
        self.ready.remove(&conn);
        self.emit(
            Recipients::All,
            ServerMessage::PlayerLeft(PlayerLeftMsg { player_id: conn }),
        );
        info!(
            player_id = conn,
            score = player.score,
            players = self.state.players.len(),
            "Player left"
        );
        self.emit_lobby_update();
        true
    }

    /// Record the client-reported pose and relay it to everyone else.
    /// Positions are trusted as reported.
    pub fn move_player(&mut self, conn: ConnectionId, pose: Pose) -> Result<(), Rejection> {
        if self.state.phase == MatchPhase::Ended {
            return Err(Rejection::MatchEnded);
        }
        let Some(player) = self.state.players.get_mut(&conn) else {
            debug!(conn_id = conn, "Move from unknown connection ignored");
            return Err(Rejection::UnknownConnection(conn));
        };
        player.pose = pose;
        self.emit(
            Recipients::AllExcept(conn),
            ServerMessage::PlayerMoved(PlayerMovedMsg {
                player_id: conn,
                position: pose.position,
                rotation: pose.rotation,
            }),
        );
        Ok(())
    }

    /// Claim a treasure for the player on `conn`.
    ///
    /// The first claim processed wins. `generation` is the match generation
    /// the client believed it was in; `None` skips that check. A rejected
    /// claim changes nothing and emits nothing.
    pub fn collect_treasure(
        &mut self,
        conn: ConnectionId,
        treasure_id: &str,
        generation: Option<u64>,
    ) -> Result<CollectReceipt, Rejection> {
        let result = self.apply_collect(conn, treasure_id, generation);
        match &result {
            Ok(receipt) => {
                self.emit(
                    Recipients::All,
                    ServerMessage::TreasureCollected(TreasureCollectedMsg {
                        treasure_id: receipt.treasure_id.clone(),
                        collector_id: receipt.collector_id,
                        new_score: receipt.new_score,
                    }),
                );
                info!(
                    player_id = conn,
                    treasure_id,
                    points = receipt.points,
                    score = receipt.new_score,
                    "Treasure collected"
                );
            },
            Err(reason) => {
                debug!(conn_id = conn, treasure_id, %reason, "Collect rejected");
            },
        }
        result
    }

    fn apply_collect(
        &mut self,
        conn: ConnectionId,
        treasure_id: &str,
        generation: Option<u64>,
    ) -> Result<CollectReceipt, Rejection> {
        match self.state.phase {
            MatchPhase::Running => {},
            MatchPhase::Lobby => return Err(Rejection::NotRunning),
            MatchPhase::Ended => return Err(Rejection::MatchEnded),
        }
        if let Some(got) = generation
            && got != self.state.generation
        {
            return Err(Rejection::StaleGeneration {
                expected: self.state.generation,
                got,
            });
        }
        let state = &mut self.state;
        let Some(player) = state.players.get_mut(&conn) else {
            return Err(Rejection::UnknownConnection(conn));
        };
        let Some(treasure) = state.treasures.get_mut(treasure_id) else {
            return Err(Rejection::UnknownTreasure(treasure_id.to_string()));
        };
        if let Some(by) = treasure.collected_by {
            return Err(Rejection::AlreadyCollected { by });
        }
        treasure.collected_by = Some(conn);
        player.score = player.score.saturating_add(treasure.points);
        Ok(CollectReceipt {
            treasure_id: treasure.id.clone(),
            collector_id: conn,
            points: treasure.points,
            new_score: player.score,
        })
    }

    /// Player-ready signal. Only meaningful in the Lobby.
    pub fn mark_ready(&mut self, conn: ConnectionId) -> Result<(), Rejection> {
        if !self.state.players.contains_key(&conn) {
            return Err(Rejection::UnknownConnection(conn));
        }
        if self.state.phase != MatchPhase::Lobby {
            return Err(Rejection::NotInLobby);
        }
        self.ready.insert(conn);
        debug!(player_id = conn, ready = self.ready.len(), "Player ready");
        self.maybe_start();
        self.emit_lobby_update();
        Ok(())
    }

    /// Leave the Lobby and start the clock. Returns false in any other phase.
    pub fn start(&mut self) -> bool {
        if self.state.phase != MatchPhase::Lobby {
            return false;
        }
        self.state.phase = MatchPhase::Running;
        self.state.time_remaining = self.config.duration_secs;
        self.ready.clear();
        self.emit(
            Recipients::All,
            ServerMessage::MatchStarted(MatchStartedMsg {
                generation: self.state.generation,
                time_remaining: self.state.time_remaining,
            }),
        );
        info!(
            generation = self.state.generation,
            players = self.state.players.len(),
            "Match started"
        );
        true
    }

    fn maybe_start(&mut self) {
        if self.state.phase != MatchPhase::Lobby {
            return;
        }
        let go = match self.config.start_policy {
            StartPolicy::Immediate => true,
            StartPolicy::FirstJoin => !self.state.players.is_empty(),
            StartPolicy::FirstReady => !self.ready.is_empty(),
        };
        if go {
            self.start();
        }
    }

    fn emit_lobby_update(&mut self) {
        if self.state.phase != MatchPhase::Lobby {
            return;
        }
        let msg = LobbyUpdateMsg {
            ready: u32::try_from(self.ready.len()).unwrap_or(u32::MAX),
            players: u32::try_from(self.state.players.len()).unwrap_or(u32::MAX),
        };
        self.emit(Recipients::All, ServerMessage::LobbyUpdate(msg));
    }

    /// Advance the match clock by one second.
    pub fn tick(&mut self) -> TickOutcome {
        match self.state.phase {
            MatchPhase::Lobby => TickOutcome::Idle,
            MatchPhase::Running => {
                self.state.time_remaining = self.state.time_remaining.saturating_sub(1);
                let remaining = self.state.time_remaining;
                self.emit(
                    Recipients::All,
                    ServerMessage::TimeUpdate(TimeUpdateMsg {
                        time_remaining: remaining,
                    }),
                );
                if remaining == 0 {
                    self.end();
                    TickOutcome::Ended
                } else {
                    TickOutcome::Counting(remaining)
                }
            },
            MatchPhase::Ended => {
                self.ended_ticks = self.ended_ticks.saturating_add(1);
                match self.config.auto_reset_pause() {
                    Some(pause) if self.ended_ticks >= pause => {
                        self.reset();
                        TickOutcome::Reset
                    },
                    _ => TickOutcome::Idle,
                }
            },
        }
    }

    fn end(&mut self) {
        self.state.phase = MatchPhase::Ended;
        self.ended_ticks = 0;
        if self.match_over_sent {
            return;
        }
        self.match_over_sent = true;
        let (winner_id, scores) = self.state.standings();
        info!(
            generation = self.state.generation,
            winner = ?winner_id,
            players = scores.len(),
            "Match over"
        );
        self.emit(
            Recipients::All,
            ServerMessage::MatchOver(MatchOverMsg { winner_id, scores }),
        );
    }

    /// Start a new generation without dropping anyone: fresh treasures,
    /// zeroed scores, full clock.
    pub fn reset(&mut self) {
        let generation = self.state.generation + 1;
        let treasures = generate_treasures(&mut self.rng, &self.config, generation);
        self.state.generation = generation;
        self.state.treasures = treasures.into_iter().map(|t| (t.id.clone(), t)).collect();
        for player in self.state.players.values_mut() {
            player.score = 0;
        }
        self.state.time_remaining = self.config.duration_secs;
        self.state.phase = match self.config.reset_phase {
            ResetPhase::Running => MatchPhase::Running,
            ResetPhase::Lobby => MatchPhase::Lobby,
        };
        self.ready.clear();
        self.ended_ticks = 0;
        self.match_over_sent = false;

        self.emit(
            Recipients::All,
            ServerMessage::MatchReset(Box::new(MatchResetMsg {
                snapshot: self.state.snapshot(),
            })),
        );
        info!(
            generation,
            phase = ?self.state.phase,
            treasures = self.state.treasures.len(),
            "Match reset"
        );
        self.maybe_start();
    }
}

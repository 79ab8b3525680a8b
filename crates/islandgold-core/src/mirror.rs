//! Client-side follower of the coordinator's event stream.
//!
//! A [`MatchMirror`] has no authority: it rebuilds a [`Match`] from the
//! snapshot it receives on join and then applies broadcasts in arrival
//! order. Every applied change is republished on an [`EventBus`] as a
//! [`MirrorEvent`] for local consumers.

use tracing::debug;

use crate::bus::EventBus;
use crate::match_state::{Match, MatchPhase};
use crate::net::messages::{ClientMessage, CollectMsg, MoveMsg, ServerMessage};
use crate::net::protocol::decode_server_message;
use crate::player::{PlayerId, Pose, ScoreEntry, Vec3};
use crate::treasure::TreasureId;

/// A change the mirror applied, for UI/audio/render collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorEvent {
    /// Whole state replaced by a snapshot or a reset.
    StateReplaced { generation: u64 },
    PlayerAdded(PlayerId),
    PlayerRemoved(PlayerId),
    PlayerMoved {
        player_id: PlayerId,
        position: Vec3,
        rotation: f32,
    },
    TreasureCollected {
        treasure_id: TreasureId,
        collector_id: PlayerId,
        new_score: u32,
        /// The local player is the collector.
        local: bool,
    },
    ClockChanged(u32),
    MatchStarted { generation: u64 },
    LobbyChanged { ready: u32, players: u32 },
    MatchOver {
        winner_id: Option<PlayerId>,
        scores: Vec<ScoreEntry>,
    },
    JoinRejected(String),
}

/// Standings as last announced by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalStandings {
    pub winner_id: Option<PlayerId>,
    pub scores: Vec<ScoreEntry>,
}

#[derive(Debug, Default)]
pub struct MatchMirror {
    local_id: Option<PlayerId>,
    /// `None` until the first snapshot arrives.
    state: Option<Match>,
    frozen: bool,
    standings: Option<FinalStandings>,
    lobby: Option<(u32, u32)>,
    events: EventBus<MirrorEvent>,
}

impl MatchMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&mut self) -> &mut EventBus<MirrorEvent> {
        &mut self.events
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn local_id(&self) -> Option<PlayerId> {
        self.local_id
    }

    pub fn state(&self) -> Option<&Match> {
        self.state.as_ref()
    }

    /// True after `match-over` until the next snapshot or reset.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn final_standings(&self) -> Option<&FinalStandings> {
        self.standings.as_ref()
    }

    /// `(ready, players)` from the latest lobby update.
    pub fn lobby(&self) -> Option<(u32, u32)> {
        self.lobby
    }

    pub fn time_remaining(&self) -> Option<u32> {
        self.state.as_ref().map(|s| s.time_remaining)
    }

    /// Players ranked by score, highest first; equal scores by id.
    pub fn leaderboard(&self) -> Vec<ScoreEntry> {
        let Some(state) = &self.state else {
            return Vec::new();
        };
        let mut board: Vec<ScoreEntry> = state
            .players
            .values()
            .map(|p| ScoreEntry {
                player_id: p.id,
                score: p.score,
            })
            .collect();
        board.sort_by(|a, b| b.score.cmp(&a.score).then(a.player_id.cmp(&b.player_id)));
        board
    }

    /// Decode one frame and apply it. Undecodable frames are ignored.
    pub fn apply_frame(&mut self, data: &[u8]) -> bool {
        match decode_server_message(data) {
            Ok(msg) => self.apply(&msg),
            Err(e) => {
                debug!(error = %e, "Ignoring undecodable frame");
                false
            },
        }
    }

    /// Apply one coordinator message. Returns true if local state changed.
    pub fn apply(&mut self, msg: &ServerMessage) -> bool {
        match msg {
            ServerMessage::Snapshot(s) => {
                self.local_id = Some(s.your_id);
                self.replace(Match::from(s.snapshot.clone()));
                true
            },
            ServerMessage::JoinRejected(r) => {
                self.events.publish(&MirrorEvent::JoinRejected(r.reason.clone()));
                false
            },
            _ if self.state.is_none() => {
                debug!(msg_type = ?msg.message_type(), "Ignoring event before snapshot");
                false
            },
            ServerMessage::MatchReset(r) => {
                self.replace(Match::from(r.snapshot.clone()));
                true
            },
            ServerMessage::PlayerJoined(j) => {
                let Some(state) = self.state.as_mut() else {
                    return false;
                };
                state.players.insert(j.player.id, j.player.clone());
                self.events.publish(&MirrorEvent::PlayerAdded(j.player.id));
                true
            },
            ServerMessage::PlayerLeft(l) => {
                let Some(state) = self.state.as_mut() else {
                    return false;
                };
                if state.players.remove(&l.player_id).is_none() {
                    return false;
                }
                self.events.publish(&MirrorEvent::PlayerRemoved(l.player_id));
                true
            },
            ServerMessage::LobbyUpdate(u) => {
                self.lobby = Some((u.ready, u.players));
                self.events.publish(&MirrorEvent::LobbyChanged {
                    ready: u.ready,
                    players: u.players,
                });
                true
            },
            _ if self.frozen => {
                debug!(msg_type = ?msg.message_type(), "Ignoring event while frozen");
                false
            },
            ServerMessage::PlayerMoved(m) => {
                self.set_pose(m.player_id, Pose::new(m.position, m.rotation))
            },
            ServerMessage::TreasureCollected(c) => {
                let local = self.local_id == Some(c.collector_id);
                let Some(state) = self.state.as_mut() else {
                    return false;
                };
                let Some(treasure) = state.treasures.get_mut(&c.treasure_id) else {
                    debug!(treasure_id = %c.treasure_id, "Collected treasure unknown locally");
                    return false;
                };
                treasure.collected_by = Some(c.collector_id);
                if let Some(player) = state.players.get_mut(&c.collector_id) {
                    player.score = c.new_score;
                }
                self.events.publish(&MirrorEvent::TreasureCollected {
                    treasure_id: c.treasure_id.clone(),
                    collector_id: c.collector_id,
                    new_score: c.new_score,
                    local,
                });
                true
            },
            ServerMessage::TimeUpdate(t) => {
                let Some(state) = self.state.as_mut() else {
                    return false;
                };
                state.time_remaining = t.time_remaining;
                self.events.publish(&MirrorEvent::ClockChanged(t.time_remaining));
                true
            },
            ServerMessage::MatchStarted(s) => {
                let Some(state) = self.state.as_mut() else {
                    return false;
                };
                if s.generation != state.generation {
                    debug!(
                        got = s.generation,
                        current = state.generation,
                        "Ignoring start for another generation"
                    );
                    return false;
                }
                state.phase = MatchPhase::Running;
                state.time_remaining = s.time_remaining;
                self.lobby = None;
                self.events.publish(&MirrorEvent::MatchStarted {
                    generation: s.generation,
                });
                true
            },
            ServerMessage::MatchOver(o) => {
                let Some(state) = self.state.as_mut() else {
                    return false;
                };
                state.phase = MatchPhase::Ended;
                state.time_remaining = 0;
                for entry in &o.scores {
                    if let Some(player) = state.players.get_mut(&entry.player_id) {
                        player.score = entry.score;
                    }
                }
                self.frozen = true;
                self.standings = Some(FinalStandings {
                    winner_id: o.winner_id,
                    scores: o.scores.clone(),
                });
                self.events.publish(&MirrorEvent::MatchOver {
                    winner_id: o.winner_id,
                    scores: o.scores.clone(),
                });
                true
            },
        }
    }

    fn replace(&mut self, state: Match) {
        let generation = state.generation;
        self.frozen = state.phase == MatchPhase::Ended;
        self.standings = None;
        if state.phase != MatchPhase::Lobby {
            self.lobby = None;
        }
        self.state = Some(state);
        self.events.publish(&MirrorEvent::StateReplaced { generation });
    }

    fn set_pose(&mut self, player_id: PlayerId, pose: Pose) -> bool {
        let Some(player) = self
            .state
            .as_mut()
            .and_then(|s| s.players.get_mut(&player_id))
        else {
            return false;
        };
        player.pose = pose;
        self.events.publish(&MirrorEvent::PlayerMoved {
            player_id,
            position: pose.position,
            rotation: pose.rotation,
        });
        true
    }

    /// Move the local player right away and return the intent to send.
    /// A later authoritative move for the local player overwrites this.
    pub fn predict_local_move(&mut self, position: Vec3, rotation: f32) -> ClientMessage {
        if !self.frozen
            && let Some(id) = self.local_id
        {
            self.set_pose(id, Pose::new(position, rotation));
        }
        ClientMessage::Move(MoveMsg { position, rotation })
    }

    /// Build a collect intent stamped with the mirrored generation, or
    /// `None` if the treasure cannot be collected as far as the mirror
    /// knows. The treasure stays until the coordinator confirms.
    pub fn collect_intent(&self, treasure_id: &str) -> Option<ClientMessage> {
        if self.frozen {
            return None;
        }
        let state = self.state.as_ref()?;
        if state.phase != MatchPhase::Running {
            return None;
        }
        let treasure = state.treasures.get(treasure_id)?;
        if treasure.is_collected() {
            return None;
        }
        Some(ClientMessage::Collect(CollectMsg {
            treasure_id: treasure.id.clone(),
            generation: Some(state.generation),
        }))
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::player::{Player, PlayerId, ScoreEntry};
use crate::treasure::{Treasure, TreasureId};

/// Coarse lifecycle stage of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPhase {
    Lobby,
    Running,
    Ended,
}

/// The aggregate root. Only the coordinator holds a mutable one.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Bumped by every reset; stale intents are detected against it.
    pub generation: u64,
    pub phase: MatchPhase,
    pub time_remaining: u32,
    pub players: BTreeMap<PlayerId, Player>,
    pub treasures: BTreeMap<TreasureId, Treasure>,
}

impl Match {
    pub fn new(generation: u64, phase: MatchPhase, time_remaining: u32, treasures: Vec<Treasure>) -> Self {
        Self {
            generation,
            phase,
            time_remaining,
            players: BTreeMap::new(),
            treasures: treasures.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    /// Players ordered by registration.
    pub fn players_in_join_order(&self) -> Vec<&Player> {
        let mut players: Vec<&Player> = self.players.values().collect();
        players.sort_by_key(|p| p.joined_order);
        players
    }

    pub fn uncollected_treasures(&self) -> impl Iterator<Item = &Treasure> {
        self.treasures.values().filter(|t| !t.is_collected())
    }

    pub fn snapshot(&self) -> MatchSnapshot {
        MatchSnapshot {
            generation: self.generation,
            phase: self.phase,
            time_remaining: self.time_remaining,
            players: self.players_in_join_order().into_iter().cloned().collect(),
            treasures: self.uncollected_treasures().cloned().collect(),
        }
    }

    /// Final scores in registration order, and the winner: highest score,
    /// ties going to whoever registered first.
    pub fn standings(&self) -> (Option<PlayerId>, Vec<ScoreEntry>) {
        let ordered = self.players_in_join_order();
        let mut winner: Option<&Player> = None;
        for &p in &ordered {
            match winner {
                Some(best) if best.score >= p.score => {},
                _ => winner = Some(p),
            }
        }
        let scores = ordered
            .iter()
            .map(|p| ScoreEntry {
                player_id: p.id,
                score: p.score,
            })
            .collect();
        (winner.map(|p| p.id), scores)
    }
}

impl From<MatchSnapshot> for Match {
    fn from(snapshot: MatchSnapshot) -> Self {
        let mut m = Match::new(
            snapshot.generation,
            snapshot.phase,
            snapshot.time_remaining,
            snapshot.treasures,
        );
        m.players = snapshot.players.into_iter().map(|p| (p.id, p)).collect();
        m
    }
}

/// Everything a fresh connection needs to render the match without replaying
/// history. Collected treasures are left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub generation: u64,
    pub phase: MatchPhase,
    pub time_remaining: u32,
    pub players: Vec<Player>,
    pub treasures: Vec<Treasure>,
}

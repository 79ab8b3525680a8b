use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use islandgold_core::config::MatchConfig;
use islandgold_core::coordinator::Coordinator;

use crate::match_loop::{MatchCommand, MatchHandle, spawn_match};

/// Longest accepted match id.
pub const MAX_MATCH_ID_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid match id: {0:?}")]
    InvalidMatchId(String),
    #[error("match limit of {0} reached")]
    TooManyMatches(usize),
}

/// Match ids appear in URLs: 1..=32 ASCII letters, digits, `-` or `_`.
pub fn is_valid_match_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_MATCH_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

struct MatchEntry {
    handle: MatchHandle,
    task: JoinHandle<()>,
    connections: usize,
    last_activity: Instant,
}

/// Owns every live match actor, keyed by match id. Matches are created on
/// first use and reaped once nobody has been connected for a while.
pub struct MatchRegistry {
    matches: BTreeMap<String, MatchEntry>,
    game: MatchConfig,
    default_match: String,
    tick: Duration,
    max_matches: usize,
}

impl MatchRegistry {
    pub fn new(game: MatchConfig, default_match: String, tick: Duration, max_matches: usize) -> Self {
        Self {
            matches: BTreeMap::new(),
            game,
            default_match,
            tick,
            max_matches,
        }
    }

    pub fn default_match(&self) -> &str {
        &self.default_match
    }

    /// Handle for `match_id`, spawning its actor if it does not exist yet.
    /// Must be called from within a Tokio runtime.
    pub fn get_or_create(&mut self, match_id: &str) -> Result<MatchHandle, RegistryError> {
        if !is_valid_match_id(match_id) {
            return Err(RegistryError::InvalidMatchId(match_id.to_string()));
        }
        if let Some(entry) = self.matches.get(match_id)
            && !entry.handle.is_closed()
        {
            return Ok(entry.handle.clone());
        }
        // A dead actor is replaced in place and does not count against the cap.
        let replacing = self.matches.remove(match_id).is_some();
        if !replacing && self.matches.len() >= self.max_matches {
            return Err(RegistryError::TooManyMatches(self.max_matches));
        }

        let coordinator = Coordinator::new(self.game.clone());
        let (handle, task) = spawn_match(match_id.to_string(), coordinator, self.tick);
        tracing::info!(match_id, matches = self.matches.len() + 1, "Match created");
        self.matches.insert(
            match_id.to_string(),
            MatchEntry {
                handle: handle.clone(),
                task,
                connections: 0,
                last_activity: Instant::now(),
            },
        );
        Ok(handle)
    }

    pub fn get(&self, match_id: &str) -> Option<MatchHandle> {
        self.matches.get(match_id).map(|e| e.handle.clone())
    }

    pub fn connection_opened(&mut self, match_id: &str) {
        if let Some(entry) = self.matches.get_mut(match_id) {
            entry.connections += 1;
            entry.last_activity = Instant::now();
        }
    }

    pub fn connection_closed(&mut self, match_id: &str) {
        if let Some(entry) = self.matches.get_mut(match_id) {
            entry.connections = entry.connections.saturating_sub(1);
            entry.last_activity = Instant::now();
        }
    }

    /// Stop and forget matches with no connections for at least `idle_for`,
    /// plus any whose actor has exited. The default match is never reaped
    /// while its actor is alive. Returns the number removed.
    pub fn reap_idle(&mut self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let before = self.matches.len();
        let default_match = &self.default_match;
        self.matches.retain(|id, entry| {
            if entry.handle.is_closed() {
                return false;
            }
            let idle = entry.connections == 0
                && now.duration_since(entry.last_activity) >= idle_for
                && id != default_match;
            if idle {
                entry.handle.send(MatchCommand::Stop);
                tracing::info!(match_id = %id, "Reaping idle match");
            }
            !idle
        });
        before - self.matches.len()
    }

    /// Ids of live matches, sorted.
    pub fn match_ids(&self) -> Vec<String> {
        self.matches.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn connection_count(&self, match_id: &str) -> usize {
        self.matches.get(match_id).map_or(0, |e| e.connections)
    }

    pub fn total_connections(&self) -> usize {
        self.matches.values().map(|e| e.connections).sum()
    }

    /// Stop every actor. Used on shutdown.
    pub fn stop_all(&mut self) {
        for (id, entry) in std::mem::take(&mut self.matches) {
            entry.handle.send(MatchCommand::Stop);
            entry.task.abort();
            tracing::debug!(match_id = %id, "Match stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use islandgold_core::match_state::MatchPhase;

    use super::*;

    fn registry(max: usize) -> MatchRegistry {
        MatchRegistry::new(
            MatchConfig::default(),
            "island".to_string(),
            Duration::from_secs(3600),
            max,
        )
    }

    #[test]
    fn match_id_validation() {
        assert!(is_valid_match_id("island"));
        assert!(is_valid_match_id("Cove_2-b"));
        assert!(is_valid_match_id(&"a".repeat(MAX_MATCH_ID_LEN)));
        assert!(!is_valid_match_id(""));
        assert!(!is_valid_match_id(&"a".repeat(MAX_MATCH_ID_LEN + 1)));
        assert!(!is_valid_match_id("has space"));
        assert!(!is_valid_match_id("../etc"));
        assert!(!is_valid_match_id("île"));
    }

    #[tokio::test]
    async fn get_or_create_reuses_live_match() {
        let mut reg = registry(4);
        let a = reg.get_or_create("island").unwrap();
        let b = reg.get_or_create("island").unwrap();
        assert_eq!(a.match_id(), b.match_id());
        assert_eq!(reg.len(), 1);

        let summary = b.summary().await.unwrap();
        assert_eq!(summary.generation, 1);
        assert_eq!(summary.phase, MatchPhase::Lobby);
        reg.stop_all();
    }

    #[tokio::test]
    async fn cap_and_invalid_ids_are_refused() {
        let mut reg = registry(2);
        reg.get_or_create("a").unwrap();
        reg.get_or_create("b").unwrap();
        assert_eq!(
            reg.get_or_create("c").unwrap_err(),
            RegistryError::TooManyMatches(2)
        );
        assert!(matches!(
            reg.get_or_create("no/slash"),
            Err(RegistryError::InvalidMatchId(_))
        ));
        assert!(reg.get("c").is_none());
        reg.stop_all();
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn idle_matches_are_reaped_except_default() {
        let mut reg = registry(8);
        reg.get_or_create("island").unwrap();
        reg.get_or_create("cove").unwrap();
        reg.get_or_create("busy").unwrap();
        reg.connection_opened("busy");

        let removed = reg.reap_idle(Duration::ZERO);
        assert_eq!(removed, 1);
        assert_eq!(reg.match_ids(), vec!["busy".to_string(), "island".to_string()]);
        assert_eq!(reg.total_connections(), 1);

        reg.connection_closed("busy");
        assert_eq!(reg.connection_count("busy"), 0);
        // Recently touched, so a long idle window keeps it.
        assert_eq!(reg.reap_idle(Duration::from_secs(3600)), 0);
        reg.stop_all();
    }

    #[tokio::test]
    async fn stopped_actor_is_replaced() {
        let mut reg = registry(1);
        let first = reg.get_or_create("island").unwrap();
        first.send(MatchCommand::Stop);
        while !first.is_closed() {
            tokio::task::yield_now().await;
        }
        let second = reg.get_or_create("island").unwrap();
        assert!(!second.is_closed());
        assert!(second.summary().await.is_some());
        reg.stop_all();
    }
}

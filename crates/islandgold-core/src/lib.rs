pub mod bus;
pub mod config;
pub mod coordinator;
pub mod match_state;
pub mod mirror;
pub mod net;
pub mod player;
pub mod treasure;

pub use config::{ConfigError, MatchConfig};
pub use coordinator::{Coordinator, Outbound, Recipients, Rejection};
pub use match_state::{Match, MatchPhase, MatchSnapshot};
pub use mirror::{MatchMirror, MirrorEvent};

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use crate::config::{MatchConfig, StartPolicy};
    use crate::coordinator::{Coordinator, Outbound};
    use crate::net::messages::ServerMessage;
    use crate::player::{ConnectionId, PlayerId, Vec3};
    use crate::treasure::{Treasure, TreasureKind};

    /// A treasure of `kind` at the origin worth the default tier points.
    pub fn make_treasure(id: &str, kind: TreasureKind) -> Treasure {
        let points = MatchConfig::default().tiers.points(kind);
        Treasure::new(id, kind, Vec3::ZERO, points)
    }

    /// A match config that starts on first join, lasts `duration_secs`
    /// and never resets by itself.
    pub fn scripted_config(duration_secs: u32) -> MatchConfig {
        MatchConfig {
            duration_secs,
            treasure_count: 10,
            start_policy: StartPolicy::FirstJoin,
            auto_reset_secs: None,
            ..MatchConfig::default()
        }
    }

    /// Coordinator with a fixed first generation.
    pub fn scripted_coordinator(duration_secs: u32, treasures: Vec<Treasure>) -> Coordinator {
        Coordinator::with_treasures(scripted_config(duration_secs), treasures)
    }

    /// Join players with ids `1..=n` named `P1..Pn`, discarding the outbox.
    pub fn join_players(coordinator: &mut Coordinator, n: u64) -> Vec<PlayerId> {
        let ids: Vec<PlayerId> = (1..=n).collect();
        for &id in &ids {
            if let Err(e) = coordinator.join(id, &format!("P{id}")) {
                panic!("join {id} failed: {e}");
            }
        }
        coordinator.drain_outbox();
        ids
    }

    /// Messages in `outbox` that `conn` would receive, in order.
    pub fn delivered_to(outbox: &[Outbound], conn: ConnectionId) -> Vec<ServerMessage> {
        outbox
            .iter()
            .filter(|o| o.to.includes(conn))
            .map(|o| o.message.clone())
            .collect()
    }
}

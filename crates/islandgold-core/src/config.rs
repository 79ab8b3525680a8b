use serde::{Deserialize, Serialize};

use crate::player::{Pose, Vec3};
use crate::treasure::TreasureKind;

/// Upper bound on treasures per match; keeps a full snapshot well inside
/// one frame.
pub const MAX_TREASURE_COUNT: u32 = 500;

const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be > 0")]
    NotPositive(&'static str),
    #[error("treasure_count {0} exceeds the maximum of {max}", max = MAX_TREASURE_COUNT)]
    TooManyTreasures(u32),
    #[error("tier weight for {0:?} must be finite and non-negative")]
    InvalidWeight(TreasureKind),
    #[error("tier weights sum to {0}, expected 1.0")]
    WeightsDoNotSumToOne(f64),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// When a match leaves the Lobby phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPolicy {
    /// The match is created already running.
    Immediate,
    /// Starts as soon as at least one player is registered.
    #[default]
    FirstJoin,
    /// Starts on the first player-ready signal.
    FirstReady,
}

/// Phase a match enters after `reset()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPhase {
    #[default]
    Running,
    Lobby,
}

/// Horizontal extent of the island; treasures are scattered uniformly over
/// `[-width/2, width/2) x [-depth/2, depth/2)` at a fixed height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldBounds {
    pub width: f32,
    pub depth: f32,
    pub treasure_height: f32,
}

impl Default for WorldBounds {
    fn default() -> Self {
        Self {
            width: 1000.0,
            depth: 1000.0,
            treasure_height: 5.0,
        }
    }
}

/// Draw weight and point value of one treasure kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub weight: f64,
    pub points: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub small: Tier,
    pub medium: Tier,
    pub large: Tier,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            small: Tier {
                weight: 0.6,
                points: 1,
            },
            medium: Tier {
                weight: 0.2,
                points: 3,
            },
            large: Tier {
                weight: 0.2,
                points: 5,
            },
        }
    }
}

impl TierTable {
    pub fn tier(&self, kind: TreasureKind) -> &Tier {
        match kind {
            TreasureKind::Small => &self.small,
            TreasureKind::Medium => &self.medium,
            TreasureKind::Large => &self.large,
        }
    }

    pub fn points(&self, kind: TreasureKind) -> u32 {
        self.tier(kind).points
    }

    /// Map a uniform roll in `[0, 1)` onto a kind by cumulative weight.
    /// Rolls past the last boundary (float rounding) fall to the last kind
    /// that has a non-zero weight.
    pub fn pick(&self, roll: f64) -> TreasureKind {
        let mut cumulative = 0.0;
        let mut fallback = TreasureKind::Small;
        for kind in TreasureKind::ALL {
            let weight = self.tier(kind).weight;
            if weight <= 0.0 {
                continue;
            }
            fallback = kind;
            cumulative += weight;
            if roll < cumulative {
                return kind;
            }
        }
        fallback
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut sum = 0.0;
        for kind in TreasureKind::ALL {
            let weight = self.tier(kind).weight;
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::InvalidWeight(kind));
            }
            sum += weight;
        }
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(ConfigError::WeightsDoNotSumToOne(sum));
        }
        Ok(())
    }
}

/// Rules for one match. Every field has a default so partial TOML tables
/// deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub duration_secs: u32,
    pub treasure_count: u32,
    pub world: WorldBounds,
    pub spawn: Pose,
    pub tiers: TierTable,
    pub start_policy: StartPolicy,
    pub reset_phase: ResetPhase,
    /// Ticks spent in Ended before the coordinator resets on its own.
    /// `None` or `0` leaves the match ended until an explicit reset; TOML
    /// has no null, so `auto_reset_secs = 0` is how a file turns it off.
    pub auto_reset_secs: Option<u32>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            duration_secs: 300,
            treasure_count: 50,
            world: WorldBounds::default(),
            spawn: Pose::new(Vec3::new(0.0, 2.0, 0.0), 0.0),
            tiers: TierTable::default(),
            start_policy: StartPolicy::default(),
            reset_phase: ResetPhase::default(),
            auto_reset_secs: Some(10),
        }
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration_secs == 0 {
            return Err(ConfigError::NotPositive("duration_secs"));
        }
        if self.treasure_count > MAX_TREASURE_COUNT {
            return Err(ConfigError::TooManyTreasures(self.treasure_count));
        }
        if !(self.world.width.is_finite() && self.world.width > 0.0) {
            return Err(ConfigError::NotPositive("world.width"));
        }
        if !(self.world.depth.is_finite() && self.world.depth > 0.0) {
            return Err(ConfigError::NotPositive("world.depth"));
        }
        if !self.world.treasure_height.is_finite() {
            return Err(ConfigError::Invalid {
                field: "world.treasure_height",
                reason: "must be finite".to_string(),
            });
        }
        if !self.spawn.position.is_finite() || !self.spawn.rotation.is_finite() {
            return Err(ConfigError::Invalid {
                field: "spawn",
                reason: "must be finite".to_string(),
            });
        }
        self.tiers.validate()
    }

    /// Post-match pause before an automatic reset, if one is enabled.
    pub fn auto_reset_pause(&self) -> Option<u32> {
        self.auto_reset_secs.filter(|&secs| secs > 0)
    }
}

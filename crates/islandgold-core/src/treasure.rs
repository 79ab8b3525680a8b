use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::MatchConfig;
use crate::player::{PlayerId, Vec3};

/// Treasure identifier, unique within a match across every generation.
pub type TreasureId = String;

/// Longest treasure id accepted from a client.
pub const MAX_TREASURE_ID_LEN: usize = 64;

/// Closed set of treasure tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreasureKind {
    Small,
    Medium,
    Large,
}

impl TreasureKind {
    pub const ALL: [TreasureKind; 3] = [
        TreasureKind::Small,
        TreasureKind::Medium,
        TreasureKind::Large,
    ];
}

/// A collectible. Position and value are fixed at generation; `collected_by`
/// is written at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Treasure {
    pub id: TreasureId,
    pub kind: TreasureKind,
    pub position: Vec3,
    pub points: u32,
    pub collected_by: Option<PlayerId>,
}

impl Treasure {
    pub fn new(id: impl Into<TreasureId>, kind: TreasureKind, position: Vec3, points: u32) -> Self {
        Self {
            id: id.into(),
            kind,
            position,
            points,
            collected_by: None,
        }
    }

    pub fn is_collected(&self) -> bool {
        self.collected_by.is_some()
    }
}

/// Id of the `index`-th treasure of a generation.
pub fn treasure_id(generation: u64, index: u32) -> TreasureId {
    format!("g{generation}-t{index}")
}

/// Scatter `config.treasure_count` treasures over the world bounds, drawing
/// each kind from the configured tier weights.
pub fn generate_treasures<R: Rng>(
    rng: &mut R,
    config: &MatchConfig,
    generation: u64,
) -> Vec<Treasure> {
    let half_w = config.world.width / 2.0;
    let half_d = config.world.depth / 2.0;
    (0..config.treasure_count)
        .map(|i| {
            let kind = config.tiers.pick(rng.random::<f64>());
            let position = Vec3::new(
                rng.random_range(-half_w..half_w),
                config.world.treasure_height,
                rng.random_range(-half_d..half_d),
            );
            Treasure::new(
                treasure_id(generation, i),
                kind,
                position,
                config.tiers.points(kind),
            )
        })
        .collect()
}

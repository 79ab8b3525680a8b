use serde::{Deserialize, Serialize};

/// Identifier of one socket connection, assigned by the host when the socket
/// is accepted. Never reused while the process lives.
pub type ConnectionId = u64;

/// A player's id is the id of the connection that registered it, so a
/// reconnect always produces a new player.
pub type PlayerId = ConnectionId;

/// World-space coordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Position plus yaw (radians), as last reported by the owning client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: f32,
}

impl Pose {
    pub const fn new(position: Vec3, rotation: f32) -> Self {
        Self { position, rotation }
    }
}

/// A participant in a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub display_name: String,
    pub pose: Pose,
    pub score: u32,
    /// Registration sequence within the match. Lower joined earlier; used
    /// to break score ties.
    pub joined_order: u64,
}

impl Player {
    pub fn new(id: PlayerId, display_name: String, pose: Pose, joined_order: u64) -> Self {
        Self {
            id,
            display_name,
            pose,
            score: 0,
            joined_order,
        }
    }
}

/// One line of a scoreboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub player_id: PlayerId,
    pub score: u32,
}

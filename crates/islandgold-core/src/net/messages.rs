use serde::{Deserialize, Serialize};

use crate::match_state::MatchSnapshot;
use crate::player::{Player, PlayerId, Pose, ScoreEntry, Vec3};
use crate::treasure::{MAX_TREASURE_ID_LEN, TreasureId};

use super::protocol::ProtocolError;

/// Longest display name accepted, in characters, after trimming.
pub const MAX_DISPLAY_NAME_LEN: usize = 24;

/// Coordinates beyond this magnitude are treated as garbage.
pub const MAX_COORDINATE: f32 = 1.0e6;

/// Network message type discriminator (first byte of every frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Client -> Coordinator
    Join = 0x01,
    Move = 0x02,
    Collect = 0x03,
    Ready = 0x04,

    // Coordinator -> Client
    Snapshot = 0x10,
    PlayerJoined = 0x11,
    PlayerLeft = 0x12,
    PlayerMoved = 0x13,
    TreasureCollected = 0x14,
    TimeUpdate = 0x15,
    MatchOver = 0x16,
    MatchReset = 0x17,
    MatchStarted = 0x18,
    LobbyUpdate = 0x19,
    JoinRejected = 0x1A,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Join),
            0x02 => Some(Self::Move),
            0x03 => Some(Self::Collect),
            0x04 => Some(Self::Ready),
            0x10 => Some(Self::Snapshot),
            0x11 => Some(Self::PlayerJoined),
            0x12 => Some(Self::PlayerLeft),
            0x13 => Some(Self::PlayerMoved),
            0x14 => Some(Self::TreasureCollected),
            0x15 => Some(Self::TimeUpdate),
            0x16 => Some(Self::MatchOver),
            0x17 => Some(Self::MatchReset),
            0x18 => Some(Self::MatchStarted),
            0x19 => Some(Self::LobbyUpdate),
            0x1A => Some(Self::JoinRejected),
            _ => None,
        }
    }

    /// Types only the coordinator may send.
    pub fn is_server_only(self) -> bool {
        (self as u8) >= 0x10
    }
}

// ============================================================================
// Client -> Coordinator
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinMsg {
    pub display_name: String,
    pub protocol_version: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveMsg {
    pub position: Vec3,
    pub rotation: f32,
}

impl MoveMsg {
    pub fn validate(&self) -> Result<Pose, ProtocolError> {
        let p = self.position;
        if !p.is_finite() || !self.rotation.is_finite() {
            return Err(ProtocolError::InvalidPayload("non-finite position"));
        }
        if p.x.abs() > MAX_COORDINATE || p.y.abs() > MAX_COORDINATE || p.z.abs() > MAX_COORDINATE {
            return Err(ProtocolError::InvalidPayload("position out of range"));
        }
        Ok(Pose::new(p, self.rotation))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectMsg {
    pub treasure_id: TreasureId,
    /// Generation the client believed it was in. Older clients omit it.
    #[serde(default)]
    pub generation: Option<u64>,
}

impl CollectMsg {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.treasure_id.is_empty() || self.treasure_id.len() > MAX_TREASURE_ID_LEN {
            return Err(ProtocolError::InvalidPayload("bad treasure id"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadyMsg {}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join(JoinMsg),
    Move(MoveMsg),
    Collect(CollectMsg),
    Ready(ReadyMsg),
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Join(_) => MessageType::Join,
            Self::Move(_) => MessageType::Move,
            Self::Collect(_) => MessageType::Collect,
            Self::Ready(_) => MessageType::Ready,
        }
    }
}

// ============================================================================
// Coordinator -> Client
// ============================================================================

/// Full state, sent only to the connection that just joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMsg {
    pub your_id: PlayerId,
    pub snapshot: MatchSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerJoinedMsg {
    pub player: Player,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLeftMsg {
    pub player_id: PlayerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerMovedMsg {
    pub player_id: PlayerId,
    pub position: Vec3,
    pub rotation: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreasureCollectedMsg {
    pub treasure_id: TreasureId,
    pub collector_id: PlayerId,
    pub new_score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeUpdateMsg {
    pub time_remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOverMsg {
    pub winner_id: Option<PlayerId>,
    pub scores: Vec<ScoreEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResetMsg {
    pub snapshot: MatchSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchStartedMsg {
    pub generation: u64,
    pub time_remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyUpdateMsg {
    pub ready: u32,
    pub players: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRejectedMsg {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Snapshot(Box<SnapshotMsg>),
    PlayerJoined(PlayerJoinedMsg),
    PlayerLeft(PlayerLeftMsg),
    PlayerMoved(PlayerMovedMsg),
    TreasureCollected(TreasureCollectedMsg),
    TimeUpdate(TimeUpdateMsg),
    MatchOver(MatchOverMsg),
    MatchReset(Box<MatchResetMsg>),
    MatchStarted(MatchStartedMsg),
    LobbyUpdate(LobbyUpdateMsg),
    JoinRejected(JoinRejectedMsg),
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Snapshot(_) => MessageType::Snapshot,
            Self::PlayerJoined(_) => MessageType::PlayerJoined,
            Self::PlayerLeft(_) => MessageType::PlayerLeft,
            Self::PlayerMoved(_) => MessageType::PlayerMoved,
            Self::TreasureCollected(_) => MessageType::TreasureCollected,
            Self::TimeUpdate(_) => MessageType::TimeUpdate,
            Self::MatchOver(_) => MessageType::MatchOver,
            Self::MatchReset(_) => MessageType::MatchReset,
            Self::MatchStarted(_) => MessageType::MatchStarted,
            Self::LobbyUpdate(_) => MessageType::LobbyUpdate,
            Self::JoinRejected(_) => MessageType::JoinRejected,
        }
    }
}

/// Trim and check a client-supplied display name.
pub fn validate_display_name(raw: &str) -> Result<String, ProtocolError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ProtocolError::InvalidPayload("empty display name"));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(ProtocolError::InvalidPayload("display name too long"));
    }
    if name.chars().any(char::is_control) {
        return Err(ProtocolError::InvalidPayload("control character in display name"));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_is_trimmed() {
        assert_eq!(validate_display_name("  Ada  ").unwrap(), "Ada");
    }

    #[test]
    fn display_name_rejects_blank_long_and_control() {
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"x".repeat(MAX_DISPLAY_NAME_LEN + 1)).is_err());
        assert!(validate_display_name("bad\u{7}name").is_err());
    }

    #[test]
    fn display_name_length_counts_chars_not_bytes() {
        let name = "é".repeat(MAX_DISPLAY_NAME_LEN);
        assert!(validate_display_name(&name).is_ok());
    }

    #[test]
    fn move_rejects_non_finite_and_far_positions() {
        let nan = MoveMsg {
            position: Vec3::new(f32::NAN, 0.0, 0.0),
            rotation: 0.0,
        };
        assert!(nan.validate().is_err());
        let spin = MoveMsg {
            position: Vec3::ZERO,
            rotation: f32::INFINITY,
        };
        assert!(spin.validate().is_err());
        let far = MoveMsg {
            position: Vec3::new(0.0, 0.0, 2.0e6),
            rotation: 0.0,
        };
        assert!(far.validate().is_err());
    }

    #[test]
    fn move_accepts_normal_pose() {
        let msg = MoveMsg {
            position: Vec3::new(12.5, 3.0, -40.0),
            rotation: 1.57,
        };
        let pose = msg.validate().unwrap();
        assert_eq!(pose.position, msg.position);
        assert_eq!(pose.rotation, 1.57);
    }

    #[test]
    fn collect_rejects_empty_and_oversized_ids() {
        let empty = CollectMsg {
            treasure_id: String::new(),
            generation: None,
        };
        assert!(empty.validate().is_err());
        let long = CollectMsg {
            treasure_id: "t".repeat(MAX_TREASURE_ID_LEN + 1),
            generation: Some(1),
        };
        assert!(long.validate().is_err());
    }

    #[test]
    fn server_only_types() {
        assert!(!MessageType::Join.is_server_only());
        assert!(!MessageType::Ready.is_server_only());
        assert!(MessageType::Snapshot.is_server_only());
        assert!(MessageType::JoinRejected.is_server_only());
    }
}

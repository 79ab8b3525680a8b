use serde::{Deserialize, Serialize};

use super::messages::{
    ClientMessage, CollectMsg, JoinMsg, JoinRejectedMsg, LobbyUpdateMsg, MatchOverMsg,
    MatchResetMsg, MatchStartedMsg, MessageType, MoveMsg, PlayerJoinedMsg, PlayerLeftMsg,
    PlayerMovedMsg, ReadyMsg, ServerMessage, SnapshotMsg, TimeUpdateMsg, TreasureCollectedMsg,
    MAX_COORDINATE, MAX_DISPLAY_NAME_LEN,
};
use crate::match_state::{MatchPhase, MatchSnapshot};
use crate::player::{Player, PlayerId, Pose, Vec3};
use crate::treasure::{Treasure, TreasureKind, treasure_id};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size in bytes, type prefix included.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("payload too large: {0} bytes (max {max})", max = MAX_MESSAGE_SIZE)]
    PayloadTooLarge(usize),
    #[error("serialize error: {0}")]
    SerializeError(String),
    #[error("deserialize error: {0}")]
    DeserializeError(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),
}

/// Encode a serializable payload with a 1-byte type prefix.
pub fn encode_message<T: Serialize>(
    msg_type: MessageType,
    payload: &T,
) -> Result<Vec<u8>, ProtocolError> {
    let payload_bytes =
        rmp_serde::to_vec(payload).map_err(|e| ProtocolError::SerializeError(e.to_string()))?;
    let total = 1 + payload_bytes.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(total));
    }
    let mut buf = Vec::with_capacity(total);
    buf.push(msg_type as u8);
    buf.extend_from_slice(&payload_bytes);
    Ok(buf)
}

pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    match msg {
        ClientMessage::Join(m) => encode_message(MessageType::Join, m),
        ClientMessage::Move(m) => encode_message(MessageType::Move, m),
        ClientMessage::Collect(m) => encode_message(MessageType::Collect, m),
        ClientMessage::Ready(m) => encode_message(MessageType::Ready, m),
    }
}

pub fn encode_server_message(msg: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    match msg {
        ServerMessage::Snapshot(m) => encode_message(MessageType::Snapshot, m),
        ServerMessage::PlayerJoined(m) => encode_message(MessageType::PlayerJoined, m),
        ServerMessage::PlayerLeft(m) => encode_message(MessageType::PlayerLeft, m),
        ServerMessage::PlayerMoved(m) => encode_message(MessageType::PlayerMoved, m),
        ServerMessage::TreasureCollected(m) => encode_message(MessageType::TreasureCollected, m),
        ServerMessage::TimeUpdate(m) => encode_message(MessageType::TimeUpdate, m),
        ServerMessage::MatchOver(m) => encode_message(MessageType::MatchOver, m),
        ServerMessage::MatchReset(m) => encode_message(MessageType::MatchReset, m),
        ServerMessage::MatchStarted(m) => encode_message(MessageType::MatchStarted, m),
        ServerMessage::LobbyUpdate(m) => encode_message(MessageType::LobbyUpdate, m),
        ServerMessage::JoinRejected(m) => encode_message(MessageType::JoinRejected, m),
    }
}

/// Extract the message type byte from raw wire data.
pub fn decode_message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    let Some(&first) = data.first() else {
        return Err(ProtocolError::EmptyMessage);
    };
    MessageType::from_byte(first).ok_or(ProtocolError::UnknownMessageType(first))
}

/// Decode a MessagePack payload (bytes after the type prefix).
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(data.len()));
    }
    rmp_serde::from_slice(&data[1..]).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    match decode_message_type(data)? {
        MessageType::Join => Ok(ClientMessage::Join(decode_payload::<JoinMsg>(data)?)),
        MessageType::Move => Ok(ClientMessage::Move(decode_payload::<MoveMsg>(data)?)),
        MessageType::Collect => Ok(ClientMessage::Collect(decode_payload::<CollectMsg>(
            data,
        )?)),
        MessageType::Ready => Ok(ClientMessage::Ready(decode_payload::<ReadyMsg>(data)?)),
        _ => Err(ProtocolError::UnknownMessageType(data[0])),
    }
}

pub fn decode_server_message(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
    match decode_message_type(data)? {
        MessageType::Snapshot => Ok(ServerMessage::Snapshot(Box::new(decode_payload::<
            SnapshotMsg,
        >(data)?))),
        MessageType::PlayerJoined => Ok(ServerMessage::PlayerJoined(decode_payload::<
            PlayerJoinedMsg,
        >(data)?)),
        MessageType::PlayerLeft => Ok(ServerMessage::PlayerLeft(decode_payload::<
            PlayerLeftMsg,
        >(data)?)),
        MessageType::PlayerMoved => Ok(ServerMessage::PlayerMoved(decode_payload::<
            PlayerMovedMsg,
        >(data)?)),
        MessageType::TreasureCollected => Ok(ServerMessage::TreasureCollected(
            decode_payload::<TreasureCollectedMsg>(data)?,
        )),
        MessageType::TimeUpdate => Ok(ServerMessage::TimeUpdate(decode_payload::<
            TimeUpdateMsg,
        >(data)?)),
        MessageType::MatchOver => Ok(ServerMessage::MatchOver(decode_payload::<MatchOverMsg>(
            data,
        )?)),
        MessageType::MatchReset => Ok(ServerMessage::MatchReset(Box::new(decode_payload::<
            MatchResetMsg,
        >(data)?))),
        MessageType::MatchStarted => Ok(ServerMessage::MatchStarted(decode_payload::<
            MatchStartedMsg,
        >(data)?)),
        MessageType::LobbyUpdate => Ok(ServerMessage::LobbyUpdate(decode_payload::<
            LobbyUpdateMsg,
        >(data)?)),
        MessageType::JoinRejected => Ok(ServerMessage::JoinRejected(decode_payload::<
            JoinRejectedMsg,
        >(data)?)),
        _ => Err(ProtocolError::UnknownMessageType(data[0])),
    }
}

/// Upper bound on the `Snapshot` frame a match with `players` players and
/// `treasure_count` treasures can produce: every name at its longest in
/// 4-byte characters, every counter and id at its widest, every treasure
/// collected.
pub fn worst_case_snapshot_len(players: usize, treasure_count: u32) -> Result<usize, ProtocolError> {
    let empty = snapshot_frame_len(0, treasure_count)?;
    let one = snapshot_frame_len(1, treasure_count)?;
    // Every player entry encodes to the same size; the array header can
    // grow by at most 4 bytes.
    Ok(empty
        .saturating_add(players.saturating_mul(one.saturating_sub(empty)))
        .saturating_add(4))
}

fn snapshot_frame_len(players: usize, treasure_count: u32) -> Result<usize, ProtocolError> {
    let pose = Pose::new(Vec3::new(-MAX_COORDINATE, -MAX_COORDINATE, -MAX_COORDINATE), -1.0);
    let name: String = std::iter::repeat_n('\u{1F3DD}', MAX_DISPLAY_NAME_LEN).collect();
    let players = (0..players)
        .map(|_| Player {
            score: u32::MAX,
            ..Player::new(PlayerId::MAX, name.clone(), pose, u64::MAX)
        })
        .collect();
    let treasures = (0..treasure_count)
        .map(|i| Treasure {
            collected_by: Some(PlayerId::MAX),
            ..Treasure::new(
                treasure_id(u64::MAX, i),
                TreasureKind::Medium,
                pose.position,
                u32::MAX,
            )
        })
        .collect();
    let msg = SnapshotMsg {
        your_id: PlayerId::MAX,
        snapshot: MatchSnapshot {
            generation: u64::MAX,
            phase: MatchPhase::Running,
            time_remaining: u32::MAX,
            players,
            treasures,
        },
    };
    rmp_serde::to_vec(&msg)
        .map(|payload| payload.len() + 1)
        .map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

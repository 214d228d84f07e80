use bincode::{Decode, Encode};

use crate::DrawingCommand;

pub const ROOM_FILE_MAGIC: [u8; 4] = *b"SKRM";
pub const ROOM_FILE_VERSION: u32 = 1;
const ROOM_HEADER_LEN: usize = ROOM_FILE_MAGIC.len() + std::mem::size_of::<u32>();

/// Durable form of a room. Timestamps are unix milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Encode, Decode)]
pub struct RoomFileData {
    pub room_id: String,
    pub created_at_ms: i64,
    pub last_activity_ms: i64,
    pub log: Vec<DrawingCommand>,
}

#[derive(Debug, thiserror::Error)]
pub enum RoomFileError {
    #[error("unsupported room file version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid room file data")]
    InvalidData,
    #[error("failed to encode room file: {0}")]
    Encode(String),
}

pub fn encode_room_file(data: &RoomFileData) -> Result<Vec<u8>, RoomFileError> {
    let body = bincode::encode_to_vec(data, bincode::config::standard())
        .map_err(|e| RoomFileError::Encode(e.to_string()))?;
    let mut payload = Vec::with_capacity(ROOM_HEADER_LEN + body.len());
    payload.extend_from_slice(&ROOM_FILE_MAGIC);
    payload.extend_from_slice(&ROOM_FILE_VERSION.to_le_bytes());
    payload.extend_from_slice(&body);
    Ok(payload)
}

pub fn decode_room_file(payload: &[u8]) -> Result<RoomFileData, RoomFileError> {
    if !(payload.len() >= ROOM_HEADER_LEN && payload.starts_with(&ROOM_FILE_MAGIC)) {
        return Err(RoomFileError::InvalidData);
    }
    let version = u32::from_le_bytes(
        payload[ROOM_FILE_MAGIC.len()..ROOM_HEADER_LEN]
            .try_into()
            .map_err(|_| RoomFileError::InvalidData)?,
    );
    let body = &payload[ROOM_HEADER_LEN..];
    match version {
        1 => bincode::decode_from_slice(body, bincode::config::standard())
            .map(|(data, _)| data)
            .map_err(|_| RoomFileError::InvalidData),
        _ => Err(RoomFileError::UnsupportedVersion(version)),
    }
}

use crate::error::RoomError;
use crate::state::AppState;
use crate::store::RoomSummary;

pub const ROOM_ID_MIN_LEN: usize = 6;
pub const ROOM_ID_MAX_LEN: usize = 8;

/// Accepts 6-8 ASCII alphanumerics, case-insensitively, and returns the
/// uppercase form used as the room key.
pub fn normalize_room_id(value: &str) -> Result<String, RoomError> {
    let value = value.trim();
    if !(ROOM_ID_MIN_LEN..=ROOM_ID_MAX_LEN).contains(&value.len()) {
        return Err(RoomError::InvalidLength);
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RoomError::InvalidCharacters);
    }
    Ok(value.to_ascii_uppercase())
}

pub struct JoinedRoom {
    pub summary: RoomSummary,
    pub is_new_room: bool,
}

/// Validates the code, finds or creates the room and refreshes its activity.
pub async fn join_room(state: &AppState, raw_room_id: &str) -> Result<JoinedRoom, RoomError> {
    let room_id = normalize_room_id(raw_room_id)?;
    let summary = state.store.touch(&room_id).await?;
    Ok(JoinedRoom {
        is_new_room: summary.command_count == 0,
        summary,
    })
}

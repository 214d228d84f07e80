use sketchroom_shared::ServerMessage;

use crate::error::StorageError;
use crate::store::RoomStore;

/// Builds the `roomJoined` payload for a joining connection: the room log
/// verbatim, open strokes of other owners included.
pub async fn build_room_joined(
    store: &RoomStore,
    room_id: &str,
    owner_id: &str,
    active_users: usize,
) -> Result<ServerMessage, StorageError> {
    let drawing_log = store.snapshot(room_id).await?;
    Ok(ServerMessage::RoomJoined {
        room_id: room_id.to_string(),
        owner_id: owner_id.to_string(),
        active_users,
        drawing_log,
    })
}

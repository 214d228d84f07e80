//! The room log store.
//!
//! Every room that has been touched since startup lives in memory behind
//! its own mutex, so read-modify-write updates of one room's log are
//! serialized while different rooms never contend. Mutations only mark the
//! room dirty; `flush_dirty` and `flush_room` write the log through to the
//! durable [`Storage`] backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sketchroom_shared::room_format::RoomFileData;
use sketchroom_shared::{DrawingCommand, Point, Stroke};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::state::MAX_POINTS_PER_STROKE;
use crate::storage::{millis_to_datetime, Storage};

pub struct Room {
    pub room_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub log: Vec<DrawingCommand>,
    dirty: bool,
}

impl Room {
    fn new(room_id: &str) -> Self {
        let now = Utc::now();
        Self {
            room_id: room_id.to_string(),
            created_at: now,
            last_activity: now,
            log: Vec::new(),
            dirty: true,
        }
    }

    fn from_file(data: RoomFileData) -> Self {
        Self {
            room_id: data.room_id,
            created_at: millis_to_datetime(data.created_at_ms),
            last_activity: millis_to_datetime(data.last_activity_ms),
            log: data.log,
            dirty: false,
        }
    }

    fn to_file(&self) -> RoomFileData {
        RoomFileData {
            room_id: self.room_id.clone(),
            created_at_ms: self.created_at.timestamp_millis(),
            last_activity_ms: self.last_activity.timestamp_millis(),
            log: self.log.clone(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.dirty = true;
    }

    fn open_stroke_mut(&mut self, owner_id: &str) -> Option<&mut Stroke> {
        self.log.iter_mut().rev().find_map(|command| match command {
            DrawingCommand::Stroke(stroke) if stroke.is_open_for(owner_id) => Some(stroke),
            _ => None,
        })
    }

    fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.room_id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            command_count: self.log.len(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RoomSummary {
    pub room_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub command_count: usize,
}

pub struct RoomStore {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    storage: Arc<dyn Storage>,
}

impl RoomStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            storage,
        }
    }

    async fn cached(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn room(&self, room_id: &str) -> Result<Arc<Mutex<Room>>, StorageError> {
        if let Some(room) = self.cached(room_id).await {
            return Ok(room);
        }
        let room = match self.storage.load_room(room_id).await? {
            Some(data) => {
                debug!(room = room_id, commands = data.log.len(), "loaded room");
                Room::from_file(data)
            }
            None => {
                info!(room = room_id, "creating room");
                Room::new(room_id)
            }
        };
        let mut rooms = self.rooms.write().await;
        let entry = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(room)));
        Ok(entry.clone())
    }

    /// Loads the room, creating an empty one if the backend has none.
    /// Does not refresh `last_activity` of an existing room.
    pub async fn find_or_create(&self, room_id: &str) -> Result<RoomSummary, StorageError> {
        let room = self.room(room_id).await?;
        let room = room.lock().await;
        Ok(room.summary())
    }

    /// Looks a room up without creating it.
    pub async fn find(&self, room_id: &str) -> Result<Option<RoomSummary>, StorageError> {
        if let Some(room) = self.cached(room_id).await {
            return Ok(Some(room.lock().await.summary()));
        }
        Ok(self
            .storage
            .load_room(room_id)
            .await?
            .map(|data| Room::from_file(data).summary()))
    }

    pub async fn touch(&self, room_id: &str) -> Result<RoomSummary, StorageError> {
        let room = self.room(room_id).await?;
        let mut room = room.lock().await;
        room.touch();
        Ok(room.summary())
    }

    /// Appends a command. A `Clear` truncates the log instead of being
    /// stored. An open stroke first finalizes any stroke its owner still has
    /// open, so each owner has at most one open stroke per room.
    pub async fn append_command(
        &self,
        room_id: &str,
        command: DrawingCommand,
    ) -> Result<DrawingCommand, StorageError> {
        let room = self.room(room_id).await?;
        let mut room = room.lock().await;
        match &command {
            DrawingCommand::Clear => room.log.clear(),
            DrawingCommand::Stroke(stroke) => {
                if !stroke.completed {
                    if let Some(previous) = room.open_stroke_mut(&stroke.owner_id) {
                        previous.completed = true;
                    }
                }
                room.log.push(command.clone());
            }
        }
        room.touch();
        Ok(command)
    }

    /// Returns `false` when the owner has no open stroke in the room.
    pub async fn append_point_to_open_stroke(
        &self,
        room_id: &str,
        owner_id: &str,
        point: Point,
    ) -> Result<bool, StorageError> {
        let room = self.room(room_id).await?;
        let mut room = room.lock().await;
        let Some(stroke) = room.open_stroke_mut(owner_id) else {
            return Ok(false);
        };
        if stroke.points.len() >= MAX_POINTS_PER_STROKE {
            return Ok(false);
        }
        stroke.points.push(point);
        room.touch();
        Ok(true)
    }

    pub async fn finalize_open_stroke(
        &self,
        room_id: &str,
        owner_id: &str,
    ) -> Result<bool, StorageError> {
        let room = self.room(room_id).await?;
        let mut room = room.lock().await;
        let Some(stroke) = room.open_stroke_mut(owner_id) else {
            return Ok(false);
        };
        stroke.completed = true;
        room.touch();
        Ok(true)
    }

    pub async fn clear(&self, room_id: &str) -> Result<(), StorageError> {
        self.append_command(room_id, DrawingCommand::Clear).await?;
        Ok(())
    }

    /// The log exactly as persisted, including strokes still being drawn.
    pub async fn snapshot(&self, room_id: &str) -> Result<Vec<DrawingCommand>, StorageError> {
        let room = self.room(room_id).await?;
        let room = room.lock().await;
        Ok(room.log.clone())
    }

    /// Deletes every room idle since before `threshold`, both in memory and
    /// in the backend. Rooms for which `in_use` returns true are kept.
    pub async fn cleanup_inactive_since<F>(
        &self,
        threshold: DateTime<Utc>,
        in_use: F,
    ) -> Result<usize, StorageError>
    where
        F: Fn(&str) -> bool,
    {
        let cached: Vec<(String, Arc<Mutex<Room>>)> = {
            let rooms = self.rooms.read().await;
            rooms
                .iter()
                .map(|(room_id, room)| (room_id.clone(), room.clone()))
                .collect()
        };
        let cached_ids: HashSet<String> = cached.iter().map(|(room_id, _)| room_id.clone()).collect();

        let mut stale = Vec::new();
        for (room_id, room) in cached {
            if in_use(&room_id) {
                continue;
            }
            if room.lock().await.last_activity < threshold {
                stale.push((room_id, room));
            }
        }

        let mut expired = Vec::new();
        {
            let mut rooms = self.rooms.write().await;
            for (room_id, room) in stale {
                // Skip rooms that were replaced or joined while unlocked.
                let unchanged = rooms
                    .get(&room_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &room));
                if !unchanged || in_use(&room_id) {
                    continue;
                }
                let still_idle = room
                    .try_lock()
                    .is_ok_and(|room| room.last_activity < threshold);
                if still_idle {
                    rooms.remove(&room_id);
                    expired.push(room_id);
                }
            }
        }

        for stored in self.storage.list_rooms().await? {
            if cached_ids.contains(&stored.room_id) || in_use(&stored.room_id) {
                continue;
            }
            if stored.last_activity < threshold {
                expired.push(stored.room_id);
            }
        }

        let mut removed = 0;
        for room_id in expired {
            match self.storage.delete_room(&room_id).await {
                Ok(()) => {
                    debug!(room = %room_id, "deleted inactive room");
                    removed += 1;
                }
                Err(error) => warn!(room = %room_id, %error, "failed to delete inactive room"),
            }
        }
        Ok(removed)
    }

    /// Writes one room through to the backend if it has unsaved changes.
    pub async fn flush_room(&self, room_id: &str) -> Result<bool, StorageError> {
        let Some(room) = self.cached(room_id).await else {
            return Ok(false);
        };
        self.save(room_id, &room).await
    }

    /// Writes every dirty room through to the backend. Failed rooms stay
    /// dirty and are retried by the next call.
    pub async fn flush_dirty(&self) -> usize {
        let rooms = {
            let rooms = self.rooms.read().await;
            rooms
                .iter()
                .map(|(room_id, room)| (room_id.clone(), room.clone()))
                .collect::<Vec<_>>()
        };
        let mut saved = 0;
        for (room_id, room) in rooms {
            match self.save(&room_id, &room).await {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(error) => warn!(room = %room_id, %error, "failed to persist room, will retry"),
            }
        }
        saved
    }

    async fn save(&self, room_id: &str, room: &Mutex<Room>) -> Result<bool, StorageError> {
        let data = {
            let mut room = room.lock().await;
            if !room.dirty {
                return Ok(false);
            }
            room.dirty = false;
            room.to_file()
        };
        if let Err(error) = self.storage.save_room(&data).await {
            room.lock().await.dirty = true;
            return Err(error);
        }
        debug!(room = room_id, commands = data.log.len(), "persisted room");
        Ok(true)
    }
}

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::StorageError;
use crate::state::AppState;

/// Removes rooms idle for at least `ttl` as of `now`. Rooms that still have
/// members or open connections are never removed.
pub async fn sweep_once(state: &AppState, ttl: Duration, now: DateTime<Utc>) -> Result<usize, StorageError> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    let threshold = now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let registry = state.registry.clone();
    let broadcaster = state.broadcaster.clone();
    state
        .store
        .cleanup_inactive_since(threshold, |room_id| {
            registry.is_active(room_id) || broadcaster.is_occupied(room_id)
        })
        .await
}

pub fn spawn_sweeper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.cleanup_interval);
        // The first tick completes immediately; skip it so startup stays cheap.
        interval.tick().await;
        loop {
            interval.tick().await;
            match sweep_once(&state, state.config.room_ttl, Utc::now()).await {
                Ok(removed) => info!(removed, active_rooms = state.registry.room_count(), "cleaned up inactive rooms"),
                Err(error) => error!(%error, "room cleanup failed, retrying next interval"),
            }
        }
    })
}

use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::Broadcaster;
use crate::registry::Registry;
use crate::sampling::{PersistenceWriter, Sampler, DEFAULT_SAMPLE_STRIDE};
use crate::storage::Storage;
use crate::store::RoomStore;

pub const MAX_POINTS_PER_STROKE: usize = 5000;

/// Engine knobs, filled from the command line in `main`.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub sample_stride: u32,
    pub flush_interval: Duration,
    pub cleanup_interval: Duration,
    pub room_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sample_stride: DEFAULT_SAMPLE_STRIDE,
            flush_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(6 * 60 * 60),
            room_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<RoomStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub writer: Arc<PersistenceWriter>,
    pub config: SyncConfig,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, config: SyncConfig) -> Self {
        let store = Arc::new(RoomStore::new(storage));
        let writer = PersistenceWriter::new(store.clone(), Sampler::new(config.sample_stride));
        Self {
            registry: Arc::new(Registry::default()),
            store,
            broadcaster: Arc::new(Broadcaster::default()),
            writer: Arc::new(writer),
            config,
        }
    }
}

use std::sync::Arc;

use sketchroom_shared::{DrawingCommand, Point, Stroke};
use tracing::{debug, warn};

use crate::store::RoomStore;

pub const DEFAULT_SAMPLE_STRIDE: u32 = 5;

/// Admits one move event in every `stride`.
#[derive(Clone, Copy, Debug)]
pub struct Sampler {
    stride: u32,
}

impl Sampler {
    pub fn new(stride: u32) -> Self {
        Self {
            stride: stride.max(1),
        }
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// `counter` is the 1-based index of the move event within its stroke.
    pub fn admits(&self, counter: u32) -> bool {
        counter > 0 && counter % self.stride == 0
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_STRIDE)
    }
}

/// Writes the durable side of the stroke lifecycle. The first point and
/// the finalize always reach the store; move points only when sampled.
/// Failures are logged and swallowed so they never hold up broadcasting.
pub struct PersistenceWriter {
    store: Arc<RoomStore>,
    sampler: Sampler,
}

impl PersistenceWriter {
    pub fn new(store: Arc<RoomStore>, sampler: Sampler) -> Self {
        Self { store, sampler }
    }

    pub fn sampler(&self) -> Sampler {
        self.sampler
    }

    pub async fn begin_stroke(&self, room_id: &str, owner_id: &str, color: String, width: f32, first: Point) {
        let command = DrawingCommand::Stroke(Stroke::open(owner_id, color, width, first));
        if let Err(error) = self.store.append_command(room_id, command).await {
            warn!(room = room_id, owner = owner_id, %error, "lost stroke start");
        }
    }

    /// Returns whether the point was written to the log.
    pub async fn record_point(&self, room_id: &str, owner_id: &str, counter: u32, point: Point) -> bool {
        if !self.sampler.admits(counter) {
            return false;
        }
        match self
            .store
            .append_point_to_open_stroke(room_id, owner_id, point)
            .await
        {
            Ok(appended) => {
                if !appended {
                    debug!(room = room_id, owner = owner_id, "no open stroke for sampled point");
                }
                appended
            }
            Err(error) => {
                warn!(room = room_id, owner = owner_id, %error, "lost sampled point");
                false
            }
        }
    }

    pub async fn finalize(&self, room_id: &str, owner_id: &str) -> bool {
        match self.store.finalize_open_stroke(room_id, owner_id).await {
            Ok(finalized) => finalized,
            Err(error) => {
                warn!(room = room_id, owner = owner_id, %error, "failed to finalize stroke");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn writer(stride: u32) -> (Arc<RoomStore>, PersistenceWriter) {
        let store = Arc::new(RoomStore::new(Arc::new(MemoryStorage::new())));
        (store.clone(), PersistenceWriter::new(store, Sampler::new(stride)))
    }

    #[test]
    fn sampler_admits_every_nth_event() {
        let sampler = Sampler::default();
        let admitted: Vec<u32> = (1..=12).filter(|&c| sampler.admits(c)).collect();
        assert_eq!(admitted, vec![5, 10]);
        assert!(!sampler.admits(0));

        let every = Sampler::new(0);
        assert_eq!(every.stride(), 1);
        assert!(every.admits(1));
    }

    #[tokio::test]
    async fn persisted_points_are_first_plus_sampled() {
        let (store, writer) = writer(5);
        writer
            .begin_stroke("ABC123", "a", "#000000".into(), 3.0, Point::new(0.0, 0.0))
            .await;

        let moves = 23;
        let mut persisted = 0;
        for counter in 1..=moves {
            if writer
                .record_point("ABC123", "a", counter, Point::new(counter as f32, 0.0))
                .await
            {
                persisted += 1;
            }
        }
        assert!(writer.finalize("ABC123", "a").await);
        assert_eq!(persisted, moves / 5);

        let log = store.snapshot("ABC123").await.unwrap();
        let stroke = log[0].as_stroke().unwrap();
        let xs: Vec<f32> = stroke.points.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![0.0, 5.0, 10.0, 15.0, 20.0]);
        assert!(stroke.completed);
    }

    #[tokio::test]
    async fn points_without_an_open_stroke_are_dropped() {
        let (store, writer) = writer(1);
        assert!(!writer.record_point("ABC123", "a", 1, Point::new(1.0, 1.0)).await);
        assert!(!writer.finalize("ABC123", "a").await);
        assert!(store.snapshot("ABC123").await.unwrap().is_empty());
    }
}

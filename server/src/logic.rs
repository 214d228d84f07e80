use sketchroom_shared::{ClientMessage, Point, ServerMessage};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rooms::normalize_room_id;
use crate::snapshot::build_room_joined;
use crate::state::AppState;
use crate::tracker::{StrokeStep, StrokeTracker};

const MAX_OWNER_ID_LEN: usize = 64;
const MAX_COLOR_LEN: usize = 32;
const DEFAULT_COLOR: &str = "#000000";
const DEFAULT_WIDTH: f32 = 3.0;
const MAX_WIDTH: f32 = 100.0;

struct Membership {
    room_id: String,
    owner_id: String,
}

/// Everything one connection owns: who it is, where it is, and what it is
/// drawing. Lives in the connection's task and dies with it.
pub struct ConnectionSession {
    connection_id: Uuid,
    membership: Option<Membership>,
    tracker: StrokeTracker,
}

impl ConnectionSession {
    pub fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            membership: None,
            tracker: StrokeTracker::new(),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn room_id(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.room_id.as_str())
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.owner_id.as_str())
    }

    pub fn is_drawing(&self) -> bool {
        self.tracker.is_drawing()
    }

    pub async fn apply(&mut self, state: &AppState, message: ClientMessage) {
        match message {
            ClientMessage::Join { room_id, owner_id } => self.join(state, &room_id, owner_id).await,
            ClientMessage::Leave => self.leave(state).await,
            ClientMessage::CursorMove { x, y } => {
                let (Some(membership), Some(point)) = (&self.membership, normalize_point(x, y)) else {
                    return;
                };
                state.broadcaster.to_room_except_origin(
                    &membership.room_id,
                    self.connection_id,
                    ServerMessage::CursorUpdate {
                        owner_id: membership.owner_id.clone(),
                        x: point.x,
                        y: point.y,
                    },
                );
            }
            ClientMessage::StrokeStart { x, y, color, width } => {
                let (Some(membership), Some(point)) = (&self.membership, normalize_point(x, y)) else {
                    return;
                };
                let Some(step) = self
                    .tracker
                    .start(point, sanitize_color(color), sanitize_width(width))
                else {
                    debug!(conn = %self.connection_id, "ignoring duplicate stroke start");
                    return;
                };
                Self::perform(state, self.connection_id, membership, step).await;
            }
            ClientMessage::StrokeMove { x, y } => {
                let (Some(membership), Some(point)) = (&self.membership, normalize_point(x, y)) else {
                    return;
                };
                if let Some(step) = self.tracker.move_to(point) {
                    Self::perform(state, self.connection_id, membership, step).await;
                }
            }
            ClientMessage::StrokeEnd => {
                let Some(membership) = &self.membership else {
                    return;
                };
                if let Some(step) = self.tracker.end() {
                    Self::perform(state, self.connection_id, membership, step).await;
                }
            }
            ClientMessage::ClearCanvas => {
                let Some(membership) = &self.membership else {
                    return;
                };
                state.broadcaster.to_room_except_origin(
                    &membership.room_id,
                    self.connection_id,
                    ServerMessage::CanvasClear {
                        owner_id: membership.owner_id.clone(),
                    },
                );
                if let Err(error) = state.store.clear(&membership.room_id).await {
                    warn!(room = %membership.room_id, %error, "failed to clear room log");
                }
                info!(room = %membership.room_id, owner = %membership.owner_id, "canvas cleared");
            }
        }
    }

    /// Peers are notified before the store is touched.
    async fn perform(state: &AppState, origin: Uuid, membership: &Membership, step: StrokeStep) {
        let room_id = membership.room_id.as_str();
        let owner_id = membership.owner_id.as_str();
        match step {
            StrokeStep::Started { point, color, width } => {
                state.broadcaster.to_room_except_origin(
                    room_id,
                    origin,
                    ServerMessage::DrawStartBroadcast {
                        owner_id: owner_id.to_string(),
                        x: point.x,
                        y: point.y,
                        color: color.clone(),
                        width,
                    },
                );
                state
                    .writer
                    .begin_stroke(room_id, owner_id, color, width, point)
                    .await;
            }
            StrokeStep::Moved {
                point,
                color,
                width,
                sample_counter,
            } => {
                state.broadcaster.to_room_except_origin(
                    room_id,
                    origin,
                    ServerMessage::DrawMoveBroadcast {
                        owner_id: owner_id.to_string(),
                        x: point.x,
                        y: point.y,
                        color,
                        width,
                    },
                );
                state
                    .writer
                    .record_point(room_id, owner_id, sample_counter, point)
                    .await;
            }
            StrokeStep::Ended => {
                state.broadcaster.to_room_except_origin(
                    room_id,
                    origin,
                    ServerMessage::DrawEndBroadcast {
                        owner_id: owner_id.to_string(),
                    },
                );
                state.writer.finalize(room_id, owner_id).await;
            }
            StrokeStep::Abandoned => {
                if state.writer.finalize(room_id, owner_id).await {
                    debug!(room = room_id, owner = owner_id, "finalized abandoned stroke");
                }
            }
        }
    }

    async fn join(&mut self, state: &AppState, raw_room_id: &str, owner_id: Option<String>) {
        let room_id = match normalize_room_id(raw_room_id) {
            Ok(room_id) => room_id,
            Err(error) => {
                state.broadcaster.to_connection(
                    self.connection_id,
                    ServerMessage::Error {
                        message: error.to_string(),
                    },
                );
                return;
            }
        };
        let owner_id = owner_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && id.len() <= MAX_OWNER_ID_LEN)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.membership.is_some() {
            self.leave(state).await;
        }

        if let Err(error) = state.store.find_or_create(&room_id).await {
            warn!(room = %room_id, %error, "failed to load room for join");
            state.broadcaster.to_connection(
                self.connection_id,
                ServerMessage::Error {
                    message: "Failed to join room".to_string(),
                },
            );
            return;
        }

        let active_users = state.registry.join(&room_id, &owner_id);
        let joined = match build_room_joined(&state.store, &room_id, &owner_id, active_users).await {
            Ok(message) => message,
            Err(error) => {
                warn!(room = %room_id, %error, "failed to build room snapshot");
                state.registry.leave(&room_id, &owner_id);
                state.broadcaster.to_connection(
                    self.connection_id,
                    ServerMessage::Error {
                        message: "Failed to join room".to_string(),
                    },
                );
                return;
            }
        };
        // The snapshot is queued before the connection enters the fan-out
        // set, so roomJoined is always the first room event it receives.
        state.broadcaster.to_connection(self.connection_id, joined);
        state.broadcaster.enter_room(&room_id, self.connection_id);
        state.broadcaster.to_room_except_origin(
            &room_id,
            self.connection_id,
            ServerMessage::UserJoined {
                owner_id: owner_id.clone(),
                active_users,
            },
        );
        info!(room = %room_id, owner = %owner_id, conn = %self.connection_id, active_users, "joined room");
        self.membership = Some(Membership { room_id, owner_id });
    }

    /// Leaves the current room, finalizing any stroke still being drawn.
    pub async fn leave(&mut self, state: &AppState) {
        if let Some(step) = self.tracker.abandon() {
            if let Some(membership) = &self.membership {
                Self::perform(state, self.connection_id, membership, step).await;
            }
        }
        let Some(Membership { room_id, owner_id }) = self.membership.take() else {
            return;
        };
        let active_users = state.registry.leave(&room_id, &owner_id);
        state.broadcaster.to_room_except_origin(
            &room_id,
            self.connection_id,
            ServerMessage::UserLeft {
                owner_id: owner_id.clone(),
                active_users,
            },
        );
        state.broadcaster.exit_room(&room_id, self.connection_id);
        info!(room = %room_id, owner = %owner_id, conn = %self.connection_id, active_users, "left room");
        if active_users == 0 {
            if let Err(error) = state.store.flush_room(&room_id).await {
                warn!(room = %room_id, %error, "failed to persist room after last member left");
            }
        }
    }

    pub async fn disconnect(&mut self, state: &AppState) {
        self.leave(state).await;
        state.broadcaster.disconnect(self.connection_id);
    }
}

fn normalize_point(x: f32, y: f32) -> Option<Point> {
    let point = Point::new(x, y);
    point.is_finite().then_some(point)
}

fn sanitize_color(mut color: String) -> String {
    if color.is_empty() {
        return DEFAULT_COLOR.to_string();
    }
    if color.len() > MAX_COLOR_LEN {
        let mut end = MAX_COLOR_LEN;
        while !color.is_char_boundary(end) {
            end -= 1;
        }
        color.truncate(end);
    }
    color
}

fn sanitize_width(width: f32) -> f32 {
    let width = if width.is_finite() { width } else { DEFAULT_WIDTH };
    width.clamp(1.0, MAX_WIDTH)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sketchroom_shared::replay::Canvas;
    use sketchroom_shared::DrawingCommand;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::state::SyncConfig;
    use crate::storage::{MemoryStorage, Storage};

    struct Client {
        session: ConnectionSession,
        inbox: UnboundedReceiver<ServerMessage>,
    }

    impl Client {
        fn connect(state: &AppState) -> Self {
            let (tx, inbox) = mpsc::unbounded_channel();
            let session = ConnectionSession::new(Uuid::new_v4());
            state.broadcaster.connect(session.connection_id(), tx);
            Self { session, inbox }
        }

        async fn send(&mut self, state: &AppState, message: ClientMessage) {
            self.session.apply(state, message).await;
        }

        async fn join(&mut self, state: &AppState, room: &str, owner: &str) {
            self.send(
                state,
                ClientMessage::Join {
                    room_id: room.into(),
                    owner_id: Some(owner.into()),
                },
            )
            .await;
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut received = Vec::new();
            while let Ok(message) = self.inbox.try_recv() {
                received.push(message);
            }
            received
        }
    }

    fn state() -> (Arc<MemoryStorage>, AppState) {
        let storage = Arc::new(MemoryStorage::new());
        (storage.clone(), AppState::new(storage, SyncConfig::default()))
    }

    fn start(x: f32, y: f32) -> ClientMessage {
        ClientMessage::StrokeStart {
            x,
            y,
            color: "#000000".into(),
            width: 3.0,
        }
    }

    fn open_strokes_of(log: &[DrawingCommand], owner: &str) -> usize {
        log.iter()
            .filter_map(DrawingCommand::as_stroke)
            .filter(|stroke| stroke.is_open_for(owner))
            .count()
    }

    #[tokio::test]
    async fn join_sends_snapshot_to_joiner_and_notifies_peers() {
        let (_, state) = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);

        a.join(&state, "abc123", "alice").await;
        assert_eq!(
            a.drain(),
            vec![ServerMessage::RoomJoined {
                room_id: "ABC123".into(),
                owner_id: "alice".into(),
                active_users: 1,
                drawing_log: vec![],
            }]
        );

        b.join(&state, "ABC123", "bob").await;
        assert_eq!(
            a.drain(),
            vec![ServerMessage::UserJoined {
                owner_id: "bob".into(),
                active_users: 2,
            }]
        );
        assert_eq!(
            b.drain(),
            vec![ServerMessage::RoomJoined {
                room_id: "ABC123".into(),
                owner_id: "bob".into(),
                active_users: 2,
                drawing_log: vec![],
            }]
        );
    }

    #[tokio::test]
    async fn stroke_is_broadcast_in_full_and_persisted_sampled() {
        let (_, state) = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.join(&state, "ABC123", "alice").await;
        b.join(&state, "ABC123", "bob").await;
        a.drain();
        b.drain();

        a.send(&state, start(0.0, 0.0)).await;
        for i in 1..=9 {
            a.send(
                &state,
                ClientMessage::StrokeMove {
                    x: i as f32,
                    y: i as f32,
                },
            )
            .await;
        }
        a.send(&state, ClientMessage::StrokeEnd).await;

        let received = b.drain();
        assert_eq!(received.len(), 11);
        assert!(matches!(received[0], ServerMessage::DrawStartBroadcast { x, .. } if x == 0.0));
        for (i, message) in received[1..10].iter().enumerate() {
            match message {
                ServerMessage::DrawMoveBroadcast { owner_id, x, color, width, .. } => {
                    assert_eq!(owner_id, "alice");
                    assert_eq!(*x, (i + 1) as f32);
                    assert_eq!(color, "#000000");
                    assert_eq!(*width, 3.0);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            received[10],
            ServerMessage::DrawEndBroadcast {
                owner_id: "alice".into()
            }
        );
        assert!(a.drain().is_empty());

        let log = state.store.snapshot("ABC123").await.unwrap();
        assert_eq!(log.len(), 1);
        let stroke = log[0].as_stroke().unwrap();
        assert!(stroke.completed);
        assert_eq!(stroke.points, vec![Point::new(0.0, 0.0), Point::new(5.0, 5.0)]);
    }

    #[tokio::test]
    async fn clear_reaches_peers_and_late_joiners_see_empty_log() {
        let (_, state) = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.join(&state, "ABC123", "alice").await;
        b.join(&state, "ABC123", "bob").await;
        a.send(&state, start(1.0, 1.0)).await;
        a.send(&state, ClientMessage::StrokeEnd).await;
        b.drain();

        a.send(&state, ClientMessage::ClearCanvas).await;
        assert_eq!(
            b.drain(),
            vec![ServerMessage::CanvasClear {
                owner_id: "alice".into()
            }]
        );

        let mut c = Client::connect(&state);
        c.join(&state, "ABC123", "carol").await;
        match &c.drain()[0] {
            ServerMessage::RoomJoined {
                drawing_log,
                active_users,
                ..
            } => {
                assert!(drawing_log.is_empty());
                assert_eq!(*active_users, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_mid_stroke_finalizes_and_releases() {
        let (storage, state) = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.join(&state, "ABC123", "alice").await;
        b.join(&state, "ABC123", "bob").await;
        b.drain();

        a.send(&state, start(0.0, 0.0)).await;
        a.send(&state, ClientMessage::StrokeMove { x: 1.0, y: 1.0 }).await;
        a.session.disconnect(&state).await;

        let log = state.store.snapshot("ABC123").await.unwrap();
        assert_eq!(open_strokes_of(&log, "alice"), 0);
        assert_eq!(state.registry.active_count("ABC123"), 1);

        let received = b.drain();
        assert_eq!(
            received.last(),
            Some(&ServerMessage::UserLeft {
                owner_id: "alice".into(),
                active_users: 1,
            })
        );
        assert!(!received
            .iter()
            .any(|m| matches!(m, ServerMessage::DrawEndBroadcast { .. })));

        // The same owner can draw again after reconnecting.
        let mut again = Client::connect(&state);
        again.join(&state, "ABC123", "alice").await;
        again.send(&state, start(7.0, 7.0)).await;
        for i in 0..5 {
            again
                .send(&state, ClientMessage::StrokeMove { x: 8.0 + i as f32, y: 8.0 })
                .await;
        }
        let log = state.store.snapshot("ABC123").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].as_stroke().unwrap().points.len(), 2);
        assert_eq!(open_strokes_of(&log, "alice"), 1);

        b.session.disconnect(&state).await;
        again.session.disconnect(&state).await;
        assert_eq!(state.registry.active_count("ABC123"), 0);
        let saved = storage.load_room("ABC123").await.unwrap().unwrap();
        assert_eq!(open_strokes_of(&saved.log, "alice"), 0);
    }

    #[tokio::test]
    async fn leaving_notifies_remaining_peers_only() {
        let (_, state) = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.join(&state, "ABC123", "alice").await;
        b.join(&state, "ABC123", "bob").await;
        a.drain();
        b.drain();

        a.send(&state, ClientMessage::Leave).await;

        assert!(a.drain().is_empty());
        assert_eq!(
            b.drain(),
            vec![ServerMessage::UserLeft {
                owner_id: "alice".into(),
                active_users: 1,
            }]
        );
        assert_eq!(a.session.room_id(), None);
    }

    #[tokio::test]
    async fn switching_rooms_leaves_the_previous_one() {
        let (_, state) = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.join(&state, "ROOM01", "alice").await;
        b.join(&state, "ROOM01", "bob").await;
        b.drain();

        a.send(&state, start(0.0, 0.0)).await;
        a.join(&state, "ROOM02", "alice").await;

        assert_eq!(state.registry.active_count("ROOM01"), 1);
        assert_eq!(state.registry.active_count("ROOM02"), 1);
        assert_eq!(a.session.room_id(), Some("ROOM02"));
        assert!(!a.session.is_drawing());

        let log = state.store.snapshot("ROOM01").await.unwrap();
        assert_eq!(open_strokes_of(&log, "alice"), 0);
        assert!(b
            .drain()
            .iter()
            .any(|m| matches!(m, ServerMessage::UserLeft { active_users: 1, .. })));

        a.send(&state, ClientMessage::CursorMove { x: 1.0, y: 1.0 }).await;
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn events_before_join_and_out_of_order_are_ignored() {
        let (_, state) = state();
        let mut a = Client::connect(&state);
        a.send(&state, start(0.0, 0.0)).await;
        a.send(&state, ClientMessage::ClearCanvas).await;
        assert!(a.drain().is_empty());
        assert!(!a.session.is_drawing());

        let mut b = Client::connect(&state);
        a.join(&state, "ABC123", "alice").await;
        b.join(&state, "ABC123", "bob").await;
        a.drain();

        b.send(&state, ClientMessage::StrokeMove { x: 1.0, y: 1.0 }).await;
        b.send(&state, ClientMessage::StrokeEnd).await;
        b.send(&state, ClientMessage::StrokeStart {
            x: f32::NAN,
            y: 0.0,
            color: String::new(),
            width: 3.0,
        })
        .await;
        assert!(a.drain().is_empty());
        assert!(state.store.snapshot("ABC123").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_room_code_is_reported_to_the_sender_only() {
        let (_, state) = state();
        let mut a = Client::connect(&state);
        a.join(&state, "bad!", "alice").await;
        assert!(matches!(a.drain().as_slice(), [ServerMessage::Error { .. }]));
        assert_eq!(a.session.room_id(), None);
    }

    #[tokio::test]
    async fn missing_owner_id_gets_a_generated_one() {
        let (_, state) = state();
        let mut a = Client::connect(&state);
        a.send(
            &state,
            ClientMessage::Join {
                room_id: "ABC123".into(),
                owner_id: None,
            },
        )
        .await;
        let owner = a.session.owner_id().unwrap().to_string();
        assert!(Uuid::parse_str(&owner).is_ok());
    }

    #[tokio::test]
    async fn cursor_updates_go_to_peers() {
        let (_, state) = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.join(&state, "ABC123", "alice").await;
        b.join(&state, "ABC123", "bob").await;
        a.drain();

        b.send(&state, ClientMessage::CursorMove { x: 3.0, y: 4.0 }).await;
        assert_eq!(
            a.drain(),
            vec![ServerMessage::CursorUpdate {
                owner_id: "bob".into(),
                x: 3.0,
                y: 4.0,
            }]
        );
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn storage_outage_does_not_stop_live_drawing() {
        let (storage, state) = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.join(&state, "ABC123", "alice").await;
        b.join(&state, "ABC123", "bob").await;
        b.drain();

        storage.set_failing(true);
        a.send(&state, start(0.0, 0.0)).await;
        for i in 1..=5 {
            a.send(&state, ClientMessage::StrokeMove { x: i as f32, y: 0.0 })
                .await;
        }
        a.send(&state, ClientMessage::StrokeEnd).await;
        assert_eq!(b.drain().len(), 7);
        assert_eq!(state.store.flush_dirty().await, 0);

        storage.set_failing(false);
        assert_eq!(state.store.flush_dirty().await, 1);
        let saved = storage.load_room("ABC123").await.unwrap().unwrap();
        assert_eq!(saved.log[0].as_stroke().unwrap().points.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_owners_drawing_at_once_keep_all_sampled_points() {
        const MOVES: u32 = 100;
        let (_, state) = state();
        let mut joined = Vec::new();
        for owner in ["alice", "bob"] {
            let mut client = Client::connect(&state);
            client.join(&state, "ABC123", owner).await;
            joined.push(client);
        }
        let mut handles = Vec::new();
        for mut client in joined {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                client.send(&state, start(0.0, 0.0)).await;
                for i in 1..=MOVES {
                    client
                        .send(&state, ClientMessage::StrokeMove { x: i as f32, y: 0.0 })
                        .await;
                    tokio::task::yield_now().await;
                }
                client.send(&state, ClientMessage::StrokeEnd).await;
                client
            }));
        }
        let mut clients = Vec::new();
        for handle in handles {
            clients.push(handle.await.unwrap());
        }

        let log = state.store.snapshot("ABC123").await.unwrap();
        assert_eq!(log.len(), 2);
        for owner in ["alice", "bob"] {
            let stroke = log
                .iter()
                .filter_map(DrawingCommand::as_stroke)
                .find(|stroke| stroke.owner_id == owner)
                .unwrap();
            assert!(stroke.completed);
            assert_eq!(stroke.points.len() as u32, 1 + MOVES / 5);
        }

        // Each peer saw the other's full stroke and can rebuild it.
        for client in &mut clients {
            let mut canvas = Canvas::new();
            for message in client.drain() {
                canvas.apply_event(&message);
            }
            let other = canvas
                .polylines()
                .iter()
                .find(|line| Some(line.owner_id.as_str()) != client.session.owner_id())
                .unwrap();
            assert_eq!(other.points.len() as u32, 1 + MOVES);
        }
    }

    #[test]
    fn sanitizers_clamp_input() {
        assert_eq!(sanitize_color(String::new()), DEFAULT_COLOR);
        assert_eq!(sanitize_color("x".repeat(40)).len(), MAX_COLOR_LEN);
        assert_eq!(sanitize_width(f32::INFINITY), DEFAULT_WIDTH);
        assert_eq!(sanitize_width(0.0), 1.0);
        assert_eq!(sanitize_width(500.0), MAX_WIDTH);
        assert!(normalize_point(f32::NAN, 1.0).is_none());
    }
}

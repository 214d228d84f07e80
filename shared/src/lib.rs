use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

pub mod replay;
pub mod room_format;

#[derive(Serialize, Deserialize, Encode, Decode, Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// One pen-down-to-pen-up action. `completed == false` means the owner is
/// still appending to it.
#[derive(Serialize, Deserialize, Encode, Decode, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    pub owner_id: String,
    pub color: String,
    pub stroke_width: f32,
    pub points: Vec<Point>,
    pub completed: bool,
}

impl Stroke {
    pub fn open(owner_id: impl Into<String>, color: String, stroke_width: f32, first: Point) -> Self {
        Self {
            owner_id: owner_id.into(),
            color,
            stroke_width,
            points: vec![first],
            completed: false,
        }
    }

    pub fn is_open_for(&self, owner_id: &str) -> bool {
        !self.completed && self.owner_id == owner_id
    }
}

#[derive(Serialize, Deserialize, Encode, Decode, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DrawingCommand {
    Clear,
    Stroke(Stroke),
}

impl DrawingCommand {
    pub fn as_stroke(&self) -> Option<&Stroke> {
        match self {
            DrawingCommand::Stroke(stroke) => Some(stroke),
            DrawingCommand::Clear => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        room_id: String,
        #[serde(default)]
        owner_id: Option<String>,
    },
    CursorMove {
        x: f32,
        y: f32,
    },
    StrokeStart {
        x: f32,
        y: f32,
        #[serde(default)]
        color: String,
        #[serde(default)]
        width: f32,
    },
    StrokeMove {
        x: f32,
        y: f32,
    },
    StrokeEnd,
    ClearCanvas,
    Leave,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RoomJoined {
        room_id: String,
        owner_id: String,
        active_users: usize,
        drawing_log: Vec<DrawingCommand>,
    },
    UserJoined {
        owner_id: String,
        active_users: usize,
    },
    UserLeft {
        owner_id: String,
        active_users: usize,
    },
    CursorUpdate {
        owner_id: String,
        x: f32,
        y: f32,
    },
    DrawStartBroadcast {
        owner_id: String,
        x: f32,
        y: f32,
        color: String,
        width: f32,
    },
    DrawMoveBroadcast {
        owner_id: String,
        x: f32,
        y: f32,
        color: String,
        width: f32,
    },
    DrawEndBroadcast {
        owner_id: String,
    },
    CanvasClear {
        owner_id: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::RoomJoined { .. } => "roomJoined",
            ServerMessage::UserJoined { .. } => "userJoined",
            ServerMessage::UserLeft { .. } => "userLeft",
            ServerMessage::CursorUpdate { .. } => "cursorUpdate",
            ServerMessage::DrawStartBroadcast { .. } => "drawStartBroadcast",
            ServerMessage::DrawMoveBroadcast { .. } => "drawMoveBroadcast",
            ServerMessage::DrawEndBroadcast { .. } => "drawEndBroadcast",
            ServerMessage::CanvasClear { .. } => "canvasClear",
            ServerMessage::Error { .. } => "error",
        }
    }
}

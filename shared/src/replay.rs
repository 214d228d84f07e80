//! Canvas reconstruction from a room's drawing log and live events.
//!
//! Commands are applied strictly in order: `Clear` drops everything drawn
//! so far and each stroke becomes one polyline. A stroke's `completed`
//! flag does not change what is drawn, it only decides whether a later live
//! move event from the same owner extends it or starts a new polyline.

use std::collections::HashMap;

use crate::{DrawingCommand, Point, ServerMessage, Stroke};

#[derive(Clone, Debug, PartialEq)]
pub struct Polyline {
    pub owner_id: String,
    pub color: String,
    pub width: f32,
    pub points: Vec<Point>,
}

impl Polyline {
    fn from_stroke(stroke: &Stroke) -> Self {
        Self {
            owner_id: stroke.owner_id.clone(),
            color: stroke.color.clone(),
            width: stroke.stroke_width,
            points: stroke.points.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Canvas {
    polylines: Vec<Polyline>,
    open: HashMap<String, usize>,
}

impl Canvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replay(log: &[DrawingCommand]) -> Self {
        let mut canvas = Self::new();
        for command in log {
            canvas.apply(command);
        }
        canvas
    }

    pub fn apply(&mut self, command: &DrawingCommand) {
        match command {
            DrawingCommand::Clear => self.clear(),
            DrawingCommand::Stroke(stroke) => {
                self.polylines.push(Polyline::from_stroke(stroke));
                if stroke.completed {
                    self.open.remove(&stroke.owner_id);
                } else {
                    self.open
                        .insert(stroke.owner_id.clone(), self.polylines.len() - 1);
                }
            }
        }
    }

    /// Applies a live server event. Events that carry no drawing are ignored.
    pub fn apply_event(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::RoomJoined { drawing_log, .. } => {
                *self = Self::replay(drawing_log);
            }
            ServerMessage::DrawStartBroadcast {
                owner_id,
                x,
                y,
                color,
                width,
            } => self.begin(owner_id, color, *width, Point::new(*x, *y)),
            ServerMessage::DrawMoveBroadcast {
                owner_id,
                x,
                y,
                color,
                width,
            } => {
                let point = Point::new(*x, *y);
                match self
                    .open
                    .get(owner_id)
                    .and_then(|index| self.polylines.get_mut(*index))
                {
                    Some(polyline) => polyline.points.push(point),
                    // The start was missed; pick the stroke up from here.
                    None => self.begin(owner_id, color, *width, point),
                }
            }
            ServerMessage::DrawEndBroadcast { owner_id } => {
                self.open.remove(owner_id);
            }
            ServerMessage::CanvasClear { .. } => self.clear(),
            _ => {}
        }
    }

    pub fn polylines(&self) -> &[Polyline] {
        &self.polylines
    }

    pub fn is_empty(&self) -> bool {
        self.polylines.is_empty()
    }

    fn begin(&mut self, owner_id: &str, color: &str, width: f32, first: Point) {
        self.polylines.push(Polyline {
            owner_id: owner_id.to_string(),
            color: color.to_string(),
            width,
            points: vec![first],
        });
        self.open.insert(owner_id.to_string(), self.polylines.len() - 1);
    }

    fn clear(&mut self) {
        self.polylines.clear();
        self.open.clear();
    }
}

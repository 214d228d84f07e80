use sketchroom_shared::Point;

/// Style and sampling position of the stroke a connection is drawing.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveStroke {
    pub color: String,
    pub width: f32,
    pub sample_counter: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum StrokeState {
    #[default]
    Idle,
    Drawing(ActiveStroke),
}

/// What a transition asks the caller to broadcast and persist.
#[derive(Clone, Debug, PartialEq)]
pub enum StrokeStep {
    Started {
        point: Point,
        color: String,
        width: f32,
    },
    Moved {
        point: Point,
        color: String,
        width: f32,
        sample_counter: u32,
    },
    Ended,
    /// The connection went away mid-stroke; finalize without an end event.
    Abandoned,
}

/// Per-connection `Idle -> Drawing -> Idle` machine. Transitions that do
/// not apply in the current state return `None` and change nothing.
#[derive(Debug, Default)]
pub struct StrokeTracker {
    state: StrokeState,
}

impl StrokeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &StrokeState {
        &self.state
    }

    pub fn is_drawing(&self) -> bool {
        matches!(self.state(), StrokeState::Drawing(_))
    }

    pub fn start(&mut self, point: Point, color: String, width: f32) -> Option<StrokeStep> {
        if self.is_drawing() {
            return None;
        }
        self.state = StrokeState::Drawing(ActiveStroke {
            color: color.clone(),
            width,
            sample_counter: 0,
        });
        Some(StrokeStep::Started {
            point,
            color,
            width,
        })
    }

    pub fn move_to(&mut self, point: Point) -> Option<StrokeStep> {
        let StrokeState::Drawing(active) = &mut self.state else {
            return None;
        };
        active.sample_counter = active.sample_counter.saturating_add(1);
        Some(StrokeStep::Moved {
            point,
            color: active.color.clone(),
            width: active.width,
            sample_counter: active.sample_counter,
        })
    }

    pub fn end(&mut self) -> Option<StrokeStep> {
        match std::mem::take(&mut self.state) {
            StrokeState::Drawing(_) => Some(StrokeStep::Ended),
            StrokeState::Idle => None,
        }
    }

    pub fn abandon(&mut self) -> Option<StrokeStep> {
        match std::mem::take(&mut self.state) {
            StrokeState::Drawing(_) => Some(StrokeStep::Abandoned),
            StrokeState::Idle => None,
        }
    }
}

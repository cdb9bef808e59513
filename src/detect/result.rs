use serde::Serialize;

/// Candidate box straight out of an object detector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl RawDetection {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &RawDetection) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// A weapon box kept by fusion. Coordinates are source-frame pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DetectionBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub confidence: f32,
    pub class_id: u32,
    /// Origin time in seconds: the frame's timestamp, or wall clock when none was given.
    pub timestamp: f64,
}

impl DetectionBox {
    pub fn from_raw(raw: &RawDetection, timestamp: f64) -> Self {
        Self {
            x1: raw.x1 as i32,
            y1: raw.y1 as i32,
            x2: raw.x2 as i32,
            y2: raw.y2 as i32,
            confidence: raw.confidence,
            class_id: raw.class_id,
            timestamp,
        }
    }

    pub fn coordinates(&self) -> [i32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// Outcome of the violence path for one frame.
///
/// `confidence` is the dominant class probability and is reported even when
/// `detected` is false, so near-misses can be logged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ViolenceVerdict {
    pub detected: bool,
    pub confidence: f32,
}

/// Fused result of both detection paths for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameAssessment {
    pub frame_index: u64,
    pub timestamp: f64,
    pub violence: ViolenceVerdict,
    pub weapons: Vec<DetectionBox>,
}

impl FrameAssessment {
    pub fn violence_detected(&self) -> bool {
        self.violence.detected
    }

    pub fn weapons_detected(&self) -> bool {
        !self.weapons.is_empty()
    }

    /// Violence asserted or at least one weapon kept.
    pub fn is_dangerous(&self) -> bool {
        self.violence_detected() || self.weapons_detected()
    }

    /// Highest kept weapon confidence, 0 when none.
    pub fn weapon_confidence(&self) -> f32 {
        self.weapons
            .iter()
            .map(|b| b.confidence)
            .fold(0.0, f32::max)
    }

    /// Events contributed by this frame, violence first.
    pub fn events(&self) -> Vec<DetectionEvent> {
        let mut events = Vec::with_capacity(self.weapons.len() + 1);
        if self.violence.detected {
            events.push(DetectionEvent::Violence {
                confidence: self.violence.confidence,
                frame_index: self.frame_index,
                timestamp: self.timestamp,
            });
        }
        events.extend(self.weapons.iter().map(|b| DetectionEvent::Weapon {
            detection: *b,
            frame_index: self.frame_index,
            timestamp: self.timestamp,
        }));
        events
    }
}

/// One entry of a session's append-only event list.
#[derive(Clone, Debug, PartialEq)]
pub enum DetectionEvent {
    Violence {
        confidence: f32,
        frame_index: u64,
        timestamp: f64,
    },
    Weapon {
        detection: DetectionBox,
        frame_index: u64,
        timestamp: f64,
    },
}

impl DetectionEvent {
    pub fn frame_index(&self) -> u64 {
        match self {
            DetectionEvent::Violence { frame_index, .. }
            | DetectionEvent::Weapon { frame_index, .. } => *frame_index,
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            DetectionEvent::Violence { confidence, .. } => *confidence,
            DetectionEvent::Weapon { detection, .. } => detection.confidence,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            DetectionEvent::Violence { .. } => EventKind::Violence,
            DetectionEvent::Weapon { .. } => EventKind::Weapon,
        }
    }

    pub fn to_record(&self) -> DetectionRecord {
        DetectionRecord::from(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Violence,
    Weapon,
}

/// Wire form of a `DetectionEvent` as returned by the upload endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Presentation time formatted as `"12.34s"`.
    pub timestamp: String,
    pub frame: u64,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<[i32; 4]>,
}

impl From<&DetectionEvent> for DetectionRecord {
    fn from(event: &DetectionEvent) -> Self {
        match event {
            DetectionEvent::Violence {
                confidence,
                frame_index,
                timestamp,
            } => DetectionRecord {
                kind: EventKind::Violence,
                timestamp: format!("{timestamp:.2}s"),
                frame: *frame_index,
                confidence: *confidence,
                coordinates: None,
            },
            DetectionEvent::Weapon {
                detection,
                frame_index,
                timestamp,
            } => DetectionRecord {
                kind: EventKind::Weapon,
                timestamp: format!("{timestamp:.2}s"),
                frame: *frame_index,
                confidence: detection.confidence,
                coordinates: Some(detection.coordinates()),
            },
        }
    }
}

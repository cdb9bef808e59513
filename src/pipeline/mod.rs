//! Processing loops: offline batch over a file, live over a camera or
//! browser-pushed frames. Both apply the same per-frame contract: fusion,
//! then annotation and alerting.

pub mod batch;
pub mod live;
pub mod notify;

pub use batch::{BatchProcessor, BatchReport, BatchState};
pub use live::{
    read_valid_frame, CameraFactory, FrameRead, LiveCapture, LiveContext, LiveSession, LiveSettings, LoopExit,
};
pub use notify::{ClientMessage, ControlStatus, DetectionSummary, FrameDetection, Notification};

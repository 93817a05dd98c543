//! Capability interfaces for frame consumers.
//!
//! The capture loop does not know what happens to an accepted frame; it
//! forwards it to whichever sinks were injected. Sinks are synchronous calls
//! within the worker's iteration and must not block indefinitely. A frame is
//! observed by exactly one set of sinks and discarded afterwards.

use anyhow::Result;

use crate::Frame;

/// Persists accepted frames. `frame_number` counts accepted frames only;
/// dropped frames never advance it.
pub trait RecordSink: Send {
    fn record_frame(&mut self, frame: &Frame, frame_number: u64) -> Result<()>;
}

/// Calibration-pattern detection and recording.
pub trait PatternSink: Send {
    /// Runs detection on the frame. The verdict feeds the all-streams
    /// rendezvous; the detected pattern is held until `record_last_pattern`
    /// or the next detection attempt.
    fn detect_pattern(&mut self, frame: &Frame, frame_number: u64) -> Result<bool>;

    /// Commits the pattern found by the last `detect_pattern` call. Only
    /// invoked when every stream detected a pattern in the same iteration.
    fn record_last_pattern(&mut self) -> Result<()>;
}

/// Hands accepted frames to a display. Rendering itself lives outside this
/// crate.
pub trait DisplaySink: Send {
    fn on_frame_ready(&mut self, frame: &Frame) -> Result<()>;
}

/// Finds a calibration pattern in a frame. The corner-finding math is an
/// external collaborator; implementations return the detected corners in
/// pixel coordinates, or `None` when the pattern is not visible.
pub trait PatternDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Option<Vec<(f32, f32)>>>;
}

/// The sinks injected into one stream worker. All optional; an empty bundle
/// makes the worker a pure receiver.
#[derive(Default)]
pub struct StreamSinks {
    pub recorder: Option<Box<dyn RecordSink>>,
    pub pattern: Option<Box<dyn PatternSink>>,
    pub display: Option<Box<dyn DisplaySink>>,
}

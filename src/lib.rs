//! Synchronized multi-camera network capture.
//!
//! This crate implements the client side of a multi-camera capture rig:
//! each camera server streams timestamped frames over TCP, one worker thread
//! per camera receives and decodes them, and a barrier-based coordinator
//! keeps the streams temporally aligned before frames reach any consumer.
//!
//! # Module Structure
//!
//! - `wire`: binary packet codec (timestamp + length-prefixed payload)
//! - `transport`: one TCP connection per camera, metadata handshake, receive
//! - `frame`: decoded frames, payload reshaping, decoder capability
//! - `sync`: N-party rendezvous, skew-based frame dropping, shutdown signaling
//! - `worker`: per-camera capture loop and the spawn/join session runner
//! - `telemetry`: rolling-window rate and bandwidth measurement
//! - `sinks`: capability interfaces for recording/detection/display consumers
//! - `record`: disk-backed recording sinks
//! - `config`: file + environment configuration, validated at startup

use serde::{Deserialize, Serialize};

use anyhow::{anyhow, Result};

pub mod config;
pub mod frame;
pub mod record;
pub mod sinks;
pub mod sync;
pub mod telemetry;
pub mod transport;
pub mod wire;
pub mod worker;

pub use config::RigConfig;
pub use frame::{assemble, Frame, FrameDecoder, PassthroughDecoder};
pub use record::{CalibrationPatternRecorder, FrameRecorder, StubPatternDetector};
pub use sinks::{DisplaySink, PatternDetector, PatternSink, RecordSink, StreamSinks};
pub use sync::{SyncCoordinator, SyncDecision, SyncMode};
pub use telemetry::Telemetry;
pub use transport::PacketTransport;
pub use worker::{CaptureSession, StreamWorker, WorkerReport};

/// Hard cap on the number of cameras in one rig. The server naming scheme
/// enumerates hosts by a single digit, so the cap is part of the deployment
/// contract, not just a sanity bound.
pub const MAX_CAMERAS: usize = 4;

// -------------------- Timestamps --------------------

/// A frame timestamp as produced by the remote server's clock.
///
/// Both fields travel as 4-byte unsigned integers in the sender's native byte
/// order (see [`wire`] for the portability caveat). Differences are assumed to
/// fit a signed 32-bit millisecond range; there is no wraparound handling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: u32,
    pub milliseconds: u32,
}

impl Timestamp {
    pub fn new(seconds: u32, milliseconds: u32) -> Self {
        Self {
            seconds,
            milliseconds,
        }
    }

    /// Signed difference `self - rhs` in milliseconds.
    pub fn diff_ms(self, rhs: Timestamp) -> i64 {
        1000 * (self.seconds as i64 - rhs.seconds as i64)
            + (self.milliseconds as i64 - rhs.milliseconds as i64)
    }
}

// -------------------- Channel metadata --------------------

/// What a camera channel carries, announced once per connection in the
/// 1-byte metadata handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    Color,
    Depth,
}

impl ChannelKind {
    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ChannelKind::Color),
            1 => Ok(ChannelKind::Depth),
            other => Err(anyhow!("unknown channel kind byte {} in metadata", other)),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            ChannelKind::Color => 0,
            ChannelKind::Depth => 1,
        }
    }
}

/// Immutable per-connection channel geometry, derived from the metadata
/// handshake. Determines the maximum legal payload size for the session.
///
/// The dimensions are the two streams of the sensor the rig is built around:
/// color 1920x1080 at 3 bytes per pixel, depth 512x424 at 2 bytes per pixel
/// with a 4500 mm expected range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelProperties {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub kind: ChannelKind,
    /// Largest depth value the sensor is expected to report, in millimeters.
    /// Only meaningful for depth channels; used for display scaling.
    pub depth_expected_max: u32,
}

impl ChannelProperties {
    pub fn for_kind(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Color => Self {
                width: 1920,
                height: 1080,
                bytes_per_pixel: 3,
                kind,
                depth_expected_max: 0,
            },
            ChannelKind::Depth => Self {
                width: 512,
                height: 424,
                bytes_per_pixel: 2,
                kind,
                depth_expected_max: 4500,
            },
        }
    }

    /// Maximum legal payload size for this channel, in bytes.
    pub fn max_payload_size(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel as usize
    }

    /// Multiplier that maps raw depth samples onto the full sample range for
    /// visualization. 1 for color channels.
    pub fn display_scale(&self) -> u32 {
        match self.kind {
            ChannelKind::Color => 1,
            ChannelKind::Depth => (1u32 << (8 * self.bytes_per_pixel)) / self.depth_expected_max,
        }
    }
}

// -------------------- Packets --------------------

/// One received unit: a timestamp plus the raw payload bytes.
///
/// A packet is exclusively owned by the worker that received it until it is
/// handed to the frame assembler; it is never shared across threads. The
/// end-of-stream condition is represented as `None` at the receive APIs, not
/// as a packet value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkPacket {
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

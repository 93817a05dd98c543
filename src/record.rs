//! Disk-backed recording sinks.
//!
//! `FrameRecorder` writes every `recording_cycle`-th accepted frame as an
//! image file under a per-camera directory: JPEG for color frames, 16-bit
//! PNG for depth. `CalibrationPatternRecorder` runs an injected
//! [`PatternDetector`] on the same cadence and appends the committed corner
//! sets to a per-camera JSON lines file, one observation per line.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::sinks::{PatternDetector, PatternSink, RecordSink};
use crate::{ChannelKind, Frame};

// -------------------- Frame recording --------------------

pub struct FrameRecorder {
    directory: PathBuf,
    recording_cycle: u64,
    camera_index: usize,
    saved_frames: u64,
}

impl FrameRecorder {
    /// Creates `<root>/<camera_index>/` and records into it.
    pub fn new(root: &Path, camera_index: usize, recording_cycle: u64) -> Result<Self> {
        if recording_cycle == 0 {
            return Err(anyhow!("recording cycle must be at least one frame"));
        }
        let directory = root.join(camera_index.to_string());
        fs::create_dir_all(&directory)
            .with_context(|| format!("create recording directory {}", directory.display()))?;
        Ok(Self {
            directory,
            recording_cycle,
            camera_index,
            saved_frames: 0,
        })
    }

    fn due(&self, frame_number: u64) -> bool {
        self.saved_frames * self.recording_cycle < frame_number
    }
}

impl RecordSink for FrameRecorder {
    fn record_frame(&mut self, frame: &Frame, frame_number: u64) -> Result<()> {
        if !self.due(frame_number) {
            return Ok(());
        }
        let extension = match frame.kind {
            ChannelKind::Color => "jpg",
            ChannelKind::Depth => "png",
        };
        let path = self
            .directory
            .join(format!("{:02}.{}", self.saved_frames, extension));
        write_image(frame, &path)?;
        log::info!(
            "camera {}: saved frame {} to {}",
            self.camera_index,
            frame_number,
            path.display()
        );
        self.saved_frames += 1;
        Ok(())
    }
}

fn write_image(frame: &Frame, path: &Path) -> Result<()> {
    match frame.kind {
        ChannelKind::Color => {
            let image: image::RgbImage =
                image::ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone())
                    .ok_or_else(|| anyhow!("color frame buffer does not match its dimensions"))?;
            image
                .save(path)
                .with_context(|| format!("write {}", path.display()))
        }
        ChannelKind::Depth => {
            // depth samples travel as little-endian u16
            let samples: Vec<u16> = frame
                .data
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            let image: image::ImageBuffer<image::Luma<u16>, Vec<u16>> =
                image::ImageBuffer::from_raw(frame.width, frame.height, samples)
                    .ok_or_else(|| anyhow!("depth frame buffer does not match its dimensions"))?;
            image
                .save(path)
                .with_context(|| format!("write {}", path.display()))
        }
    }
}

// -------------------- Calibration pattern recording --------------------

/// One committed pattern observation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PatternObservation {
    pub frame_number: u64,
    pub corners: Vec<(f32, f32)>,
}

pub struct CalibrationPatternRecorder {
    detector: Box<dyn PatternDetector>,
    writer: BufWriter<File>,
    path: PathBuf,
    recording_cycle: u64,
    camera_index: usize,
    /// Counts committed patterns; starts at one so the first detection
    /// attempt waits a full cycle, matching the frame recorder's cadence.
    recorded_patterns: u64,
    last_pattern: Option<PatternObservation>,
}

impl CalibrationPatternRecorder {
    /// Appends observations to `<root>/pattern_corners_<camera_index>.jsonl`.
    pub fn new(
        root: &Path,
        camera_index: usize,
        recording_cycle: u64,
        detector: Box<dyn PatternDetector>,
    ) -> Result<Self> {
        if recording_cycle == 0 {
            return Err(anyhow!("recording cycle must be at least one frame"));
        }
        fs::create_dir_all(root)
            .with_context(|| format!("create recording directory {}", root.display()))?;
        let path = root.join(format!("pattern_corners_{}.jsonl", camera_index));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            detector,
            writer: BufWriter::new(file),
            path,
            recording_cycle,
            camera_index,
            recorded_patterns: 1,
            last_pattern: None,
        })
    }
}

impl PatternSink for CalibrationPatternRecorder {
    fn detect_pattern(&mut self, frame: &Frame, frame_number: u64) -> Result<bool> {
        self.last_pattern = None;
        if self.recorded_patterns * self.recording_cycle >= frame_number {
            return Ok(false);
        }
        match self.detector.detect(frame)? {
            Some(corners) => {
                self.last_pattern = Some(PatternObservation {
                    frame_number,
                    corners,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_last_pattern(&mut self) -> Result<()> {
        let observation = self
            .last_pattern
            .take()
            .ok_or_else(|| anyhow!("no detected pattern to record"))?;
        serde_json::to_writer(&mut self.writer, &observation)
            .with_context(|| format!("append to {}", self.path.display()))?;
        self.writer.write_all(b"\n")?;
        self.writer
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        log::info!(
            "camera {}: recorded calibration pattern at frame {}",
            self.camera_index,
            observation.frame_number
        );
        self.recorded_patterns += 1;
        Ok(())
    }
}

/// Placeholder detector: never sees a pattern. Deployments wire in a real
/// corner detector through [`PatternDetector`]; this keeps pattern mode
/// runnable without one.
pub struct StubPatternDetector;

impl PatternDetector for StubPatternDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Option<Vec<(f32, f32)>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assemble, ChannelProperties};

    fn depth_frame() -> Frame {
        let properties = ChannelProperties::for_kind(ChannelKind::Depth);
        assemble(vec![0u8; properties.max_payload_size()], &properties).unwrap()
    }

    /// Detector scripted to find a pattern on specific frame numbers.
    struct ScriptedDetector {
        calls: u64,
        found_on_calls: Vec<u64>,
    }

    impl PatternDetector for ScriptedDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Option<Vec<(f32, f32)>>> {
            self.calls += 1;
            if self.found_on_calls.contains(&self.calls) {
                Ok(Some(vec![(1.0, 2.0), (3.0, 4.0)]))
            } else {
                Ok(None)
            }
        }
    }

    #[test]
    fn frame_recorder_writes_on_the_cycle_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = FrameRecorder::new(dir.path(), 1, 3).unwrap();
        let frame = depth_frame();

        for frame_number in 1..=7 {
            recorder.record_frame(&frame, frame_number).unwrap();
        }

        // frames 1, 4 and 7 cross the cycle boundary: saved as 00, 01, 02
        let camera_dir = dir.path().join("1");
        assert!(camera_dir.join("00.png").exists());
        assert!(camera_dir.join("01.png").exists());
        assert!(camera_dir.join("02.png").exists());
        assert!(!camera_dir.join("03.png").exists());
    }

    #[test]
    fn frame_recorder_rejects_zero_cycle() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FrameRecorder::new(dir.path(), 0, 0).is_err());
    }

    #[test]
    fn pattern_recorder_waits_a_full_cycle_before_detecting() {
        let dir = tempfile::tempdir().unwrap();
        let detector = ScriptedDetector {
            calls: 0,
            found_on_calls: vec![1],
        };
        let mut recorder =
            CalibrationPatternRecorder::new(dir.path(), 0, 5, Box::new(detector)).unwrap();
        let frame = depth_frame();

        // frames 1..=5 are inside the first cycle; the detector is not even
        // consulted
        for frame_number in 1..=5 {
            assert!(!recorder.detect_pattern(&frame, frame_number).unwrap());
        }
        // frame 6 crosses the boundary and the scripted detector fires
        assert!(recorder.detect_pattern(&frame, 6).unwrap());
    }

    #[test]
    fn pattern_recorder_appends_committed_observations() {
        let dir = tempfile::tempdir().unwrap();
        let detector = ScriptedDetector {
            calls: 0,
            found_on_calls: vec![1, 2],
        };
        let mut recorder =
            CalibrationPatternRecorder::new(dir.path(), 2, 1, Box::new(detector)).unwrap();
        let frame = depth_frame();

        assert!(recorder.detect_pattern(&frame, 2).unwrap());
        recorder.record_last_pattern().unwrap();

        assert!(recorder.detect_pattern(&frame, 3).unwrap());
        recorder.record_last_pattern().unwrap();

        // committing again without a fresh detection is an error
        assert!(recorder.record_last_pattern().is_err());

        let contents = fs::read_to_string(dir.path().join("pattern_corners_2.jsonl")).unwrap();
        let observations: Vec<PatternObservation> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].frame_number, 2);
        assert_eq!(observations[1].frame_number, 3);
    }

    #[test]
    fn stub_detector_never_finds_a_pattern() {
        let mut detector = StubPatternDetector;
        assert!(detector.detect(&depth_frame()).unwrap().is_none());
    }
}

//! rigcap - synchronized multi-camera capture client
//!
//! Connects one worker thread per camera server, keeps the streams
//! temporally aligned through the shared coordinator, and forwards accepted
//! frames to the configured sinks:
//! 1. `--record-images` saves every Nth accepted frame to disk
//! 2. `--record-pattern` records calibration-pattern detections, gated on
//!    every stream seeing the pattern in the same iteration
//! 3. `--display` hands frames to the display sink (placeholder, first
//!    camera only)
//!
//! Ctrl-C requests a cooperative stop; workers wind down together within one
//! synchronization cycle of noticing it.

use std::fs;

use anyhow::{Context, Result};
use clap::Parser;

use rig_capture::{
    CalibrationPatternRecorder, CaptureSession, DisplaySink, Frame, FrameRecorder, RigConfig,
    StreamSinks, StubPatternDetector,
};

#[derive(Parser, Debug)]
#[command(name = "rigcap", about = "Synchronized multi-camera capture client")]
struct Args {
    /// Number of camera servers to connect to
    cameras: usize,

    /// Record every Nth accepted frame to disk
    #[arg(short = 'r', long)]
    record_images: bool,

    /// Record calibration-pattern detections (adds one rendezvous per frame)
    #[arg(short = 'p', long)]
    record_pattern: bool,

    /// Forward frames to the display sink
    #[arg(short = 'd', long)]
    display: bool,

    /// Recording directory (default from config)
    #[arg(long)]
    recording_dir: Option<std::path::PathBuf>,

    /// Server port (default from config)
    #[arg(long)]
    port: Option<u16>,

    /// Server hostname prefix, e.g. "jetson" or "127.0.0."
    #[arg(long)]
    host_prefix: Option<String>,

    /// Server hostname suffix, e.g. ".local" or ""
    #[arg(long)]
    host_suffix: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = RigConfig::load()?;
    cfg.camera_count = args.cameras;
    cfg.record_images = args.record_images;
    cfg.record_pattern = args.record_pattern;
    cfg.display = args.display;
    if let Some(dir) = args.recording_dir {
        cfg.recording_dir = dir;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(prefix) = args.host_prefix {
        cfg.host_prefix = prefix;
    }
    if let Some(suffix) = args.host_suffix {
        cfg.host_suffix = suffix;
    }
    cfg.validate()?;

    if cfg.record_images || cfg.record_pattern {
        fs::create_dir_all(&cfg.recording_dir).with_context(|| {
            format!("create recording directory {}", cfg.recording_dir.display())
        })?;
    }

    log::info!(
        "rigcap: {} camera(s) at {}:{}, skew threshold {} ms",
        cfg.camera_count,
        cfg.server_host(0),
        cfg.port,
        cfg.skew_threshold_ms
    );

    let session = CaptureSession::new(cfg.clone())?;
    let coordinator = session.coordinator();
    ctrlc::set_handler(move || {
        log::info!("stop requested, winding down");
        coordinator.request_stop();
    })
    .context("install Ctrl-C handler")?;

    let reports = session.run(&|index| build_sinks(&cfg, index))?;
    for report in reports {
        log::info!(
            "camera #{}: {} frames accepted, session average {:.1} Mbps at {:.1} Hz",
            report.index + 1,
            report.accepted_frames,
            report.average_bandwidth_mbps,
            report.average_frame_rate_hz
        );
    }
    Ok(())
}

fn build_sinks(cfg: &RigConfig, index: usize) -> Result<StreamSinks> {
    let mut sinks = StreamSinks::default();
    if cfg.record_images {
        sinks.recorder = Some(Box::new(FrameRecorder::new(
            &cfg.recording_dir,
            index,
            cfg.recording_cycle,
        )?));
    }
    if cfg.record_pattern {
        sinks.pattern = Some(Box::new(CalibrationPatternRecorder::new(
            &cfg.recording_dir,
            index,
            cfg.recording_cycle,
            Box::new(StubPatternDetector),
        )?));
    }
    // only the first camera feeds the display, to keep the workspace usable
    if cfg.display && index == 0 {
        sinks.display = Some(Box::new(LogDisplay { frames: 0 }));
    }
    Ok(sinks)
}

/// Placeholder display sink: rendering lives outside this crate, so the
/// client just confirms frames are flowing.
struct LogDisplay {
    frames: u64,
}

impl DisplaySink for LogDisplay {
    fn on_frame_ready(&mut self, frame: &Frame) -> Result<()> {
        self.frames += 1;
        if self.frames % 100 == 1 {
            log::info!(
                "display: frame {} ({}x{}, {:?})",
                self.frames,
                frame.width,
                frame.height,
                frame.kind
            );
        }
        Ok(())
    }
}

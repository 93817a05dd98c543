//! camsim - simulated camera servers for local runs
//!
//! Serves the camera wire protocol for N cameras on consecutive loopback
//! addresses: camera 1 listens on 127.0.0.1, camera 2 on 127.0.0.2, and so
//! on, all on the same port. Point the client at it with
//!
//! ```text
//! camsim 2 --frames 300 &
//! rigcap 2 --host-prefix 127.0.0. --host-suffix ""
//! ```
//!
//! Each server accepts one connection, sends the metadata byte, then streams
//! synthetic frames stamped with the wall clock. `--lag-ms` holds the last
//! camera's timestamps behind the others to demonstrate the client's
//! skew-drop policy.

use std::net::TcpListener;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use rig_capture::{wire, ChannelKind, ChannelProperties, Timestamp};

#[derive(Parser, Debug)]
#[command(name = "camsim", about = "Simulated camera servers")]
struct Args {
    /// Number of camera servers to run
    cameras: usize,

    /// Port every server listens on
    #[arg(long, default_value_t = 3490)]
    port: u16,

    /// Channel kind served by every camera
    #[arg(long, default_value = "depth")]
    kind: String,

    /// Frames to serve before closing the stream
    #[arg(long, default_value_t = 300)]
    frames: u64,

    /// Frame rate in Hz
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Hold the last camera's timestamps this many ms behind the others
    #[arg(long, default_value_t = 0)]
    lag_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.cameras == 0 {
        return Err(anyhow!("need at least one camera"));
    }
    if args.fps == 0 {
        return Err(anyhow!("frame rate must be at least 1 Hz"));
    }
    let kind = match args.kind.as_str() {
        "color" => ChannelKind::Color,
        "depth" => ChannelKind::Depth,
        other => return Err(anyhow!("unknown channel kind '{}'", other)),
    };

    let mut handles = Vec::new();
    for camera in 0..args.cameras {
        let lag = if camera + 1 == args.cameras {
            Duration::from_millis(args.lag_ms)
        } else {
            Duration::ZERO
        };
        let host = format!("127.0.0.{}", camera + 1);
        let port = args.port;
        let frames = args.frames;
        let fps = args.fps;
        handles.push(
            thread::Builder::new()
                .name(format!("camsim-{}", camera + 1))
                .spawn(move || serve_camera(&host, port, kind, frames, fps, lag))
                .context("spawn server thread")?,
        );
    }

    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("server thread panicked")),
        }
    }
    Ok(())
}

fn serve_camera(
    host: &str,
    port: u16,
    kind: ChannelKind,
    frames: u64,
    fps: u32,
    lag: Duration,
) -> Result<()> {
    let listener = TcpListener::bind((host, port))
        .with_context(|| format!("bind {}:{}", host, port))?;
    log::info!("camsim: camera server on {}:{}", host, port);

    let (mut stream, peer) = listener.accept().context("accept client")?;
    log::info!("camsim {}: client connected from {}", host, peer);

    wire::write_metadata(&mut stream, kind)?;

    let properties = ChannelProperties::for_kind(kind);
    let interval = Duration::from_secs(1) / fps;
    let payload = synthetic_payload(&properties);

    for _ in 0..frames {
        let stamp = wall_clock_timestamp(lag)?;
        wire::write_packet(&mut stream, stamp, &payload)?;
        thread::sleep(interval);
    }
    // closing the connection between packets is the clean end-of-stream
    // signal
    log::info!("camsim {}: served {} frames, closing", host, frames);
    Ok(())
}

fn wall_clock_timestamp(lag: Duration) -> Result<Timestamp> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before epoch")?
        .checked_sub(lag)
        .unwrap_or(Duration::ZERO);
    Ok(Timestamp::new(
        now.as_secs() as u32,
        now.subsec_millis(),
    ))
}

/// A fixed gradient; enough for the client to decode and record.
fn synthetic_payload(properties: &ChannelProperties) -> Vec<u8> {
    let mut payload = vec![0u8; properties.max_payload_size()];
    let width = properties.width as usize * properties.bytes_per_pixel as usize;
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = ((i % width) & 0xFF) as u8;
    }
    payload
}

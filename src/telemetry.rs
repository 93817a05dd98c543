//! Rolling-window throughput measurement for one stream.
//!
//! Each worker owns one `Telemetry`; nothing here is shared across threads.
//! An iteration spans one accepted frame: `iteration_started` at the top of
//! the capture loop, `iteration_ended` once the frame has been forwarded.
//! Dropped frames restart the iteration without ending it, so
//! `iteration_started` is idempotent until the matching `iteration_ended`.
//!
//! Every `window_size` completed iterations the window is closed: rate,
//! cycle time and bandwidth are reported and the window accumulators reset,
//! while session-wide sums survive for the end-of-session averages.

use std::time::{Duration, Instant};

const BITS_PER_BYTE: u64 = 8;
const MEGABIT: f64 = (1 << 20) as f64;

/// One closed measurement window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowReport {
    pub rate_hz: f64,
    pub cycle_ms: f64,
    pub bandwidth_mbps: f64,
}

pub struct Telemetry {
    name: String,
    window_size: u32,

    frames_in_window: u32,
    window_bytes: u64,
    window_start: Instant,
    inside_iteration: bool,

    completed_windows: u32,
    session_bandwidth_sum: f64,
    session_duration: Duration,
}

impl Telemetry {
    pub fn new(name: impl Into<String>, window_size: u32) -> Self {
        Self {
            name: name.into(),
            window_size: window_size.max(1),
            frames_in_window: 0,
            window_bytes: 0,
            window_start: Instant::now(),
            inside_iteration: false,
            completed_windows: 0,
            session_bandwidth_sum: 0.0,
            session_duration: Duration::ZERO,
        }
    }

    pub fn iteration_started(&mut self) {
        self.iteration_started_at(Instant::now());
    }

    /// Idempotent within an iteration: a capture loop that restarts after a
    /// dropped frame calls this again without double counting.
    pub fn iteration_started_at(&mut self, now: Instant) {
        if self.inside_iteration {
            return;
        }
        if self.frames_in_window == 0 {
            // first sample of the current window
            self.window_start = now;
        }
        self.frames_in_window += 1;
        self.inside_iteration = true;
    }

    pub fn iteration_ended(&mut self, bytes_moved: usize) -> Option<WindowReport> {
        self.iteration_ended_at(bytes_moved, Instant::now())
    }

    /// Closes the iteration, crediting `bytes_moved` to the window. Returns
    /// the report when this iteration completed a window.
    pub fn iteration_ended_at(
        &mut self,
        bytes_moved: usize,
        now: Instant,
    ) -> Option<WindowReport> {
        if !self.inside_iteration {
            return None;
        }
        self.inside_iteration = false;
        self.window_bytes += bytes_moved as u64;

        if self.frames_in_window < self.window_size {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.window_start);
        let report = window_report(self.window_bytes, self.window_size, elapsed);
        log::info!(
            "{}: rate {:.1} Hz, cycle {:.1} ms, bandwidth {:.2} Mbps",
            self.name,
            report.rate_hz,
            report.cycle_ms,
            report.bandwidth_mbps
        );

        self.session_bandwidth_sum += report.bandwidth_mbps;
        self.session_duration += elapsed;
        self.completed_windows += 1;
        self.window_bytes = 0;
        self.frames_in_window = 0;
        Some(report)
    }

    /// Average bandwidth across all completed windows, in Mbps.
    pub fn average_bandwidth_mbps(&self) -> f64 {
        if self.completed_windows == 0 {
            return 0.0;
        }
        self.session_bandwidth_sum / self.completed_windows as f64
    }

    pub fn average_frame_rate_hz(&self) -> f64 {
        self.average_frame_rate_hz_at(Instant::now())
    }

    /// Average frame rate over the session. Falls back to the current partial
    /// window when no window has completed yet.
    pub fn average_frame_rate_hz_at(&self, now: Instant) -> f64 {
        if self.completed_windows > 0 {
            let frames = self.window_size as u64 * self.completed_windows as u64;
            let secs = self.session_duration.as_secs_f64();
            if secs == 0.0 {
                return 0.0;
            }
            return frames as f64 / secs;
        }
        let secs = now.saturating_duration_since(self.window_start).as_secs_f64();
        if self.frames_in_window == 0 || secs == 0.0 {
            return 0.0;
        }
        self.frames_in_window as f64 / secs
    }
}

fn window_report(bytes: u64, frames: u32, elapsed: Duration) -> WindowReport {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return WindowReport {
            rate_hz: 0.0,
            cycle_ms: 0.0,
            bandwidth_mbps: 0.0,
        };
    }
    let cycle = secs / frames as f64;
    WindowReport {
        rate_hz: 1.0 / cycle,
        cycle_ms: 1000.0 * cycle,
        bandwidth_mbps: (bytes * BITS_PER_BYTE) as f64 / secs / MEGABIT,
    }
}

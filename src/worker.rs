//! Per-camera capture loop and the spawn/join session runner.
//!
//! One OS thread per camera. A worker connects (retrying until its server is
//! up), performs the metadata handshake, then loops: receive a packet,
//! rendezvous with its peers, and forward accepted frames to the injected
//! sinks. All workers are released together by a start gate once every
//! thread has spawned, and joined together at shutdown.
//!
//! Unwinding discipline: a worker may only leave the loop at a cycle
//! boundary, after signaling the shared ended flag and arriving once more so
//! its peers are released and observe the flag at their next
//! post-rendezvous check. Failures inside a cycle (sink or decode errors)
//! are therefore deferred: the iteration finishes its remaining rendezvous
//! points, and the error unwinds at the top of the next cycle. No error path
//! leaves a peer blocked on the barrier.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::frame::FrameDecoder;
use crate::sinks::StreamSinks;
use crate::sync::{SyncCoordinator, SyncDecision, SyncMode};
use crate::telemetry::Telemetry;
use crate::transport::PacketTransport;
use crate::{ChannelProperties, NetworkPacket, PassthroughDecoder, RigConfig};

/// Final per-worker session summary.
#[derive(Clone, Debug)]
pub struct WorkerReport {
    pub index: usize,
    pub accepted_frames: u64,
    pub average_bandwidth_mbps: f64,
    pub average_frame_rate_hz: f64,
}

pub struct StreamWorker {
    index: usize,
    name: String,
    host: String,
    port: u16,
    connect_retry: Duration,
    transport: PacketTransport,
    coordinator: Arc<SyncCoordinator>,
    sinks: StreamSinks,
    decoder: Box<dyn FrameDecoder>,
    telemetry: Telemetry,
}

impl StreamWorker {
    pub fn new(
        index: usize,
        host: String,
        port: u16,
        config: &RigConfig,
        coordinator: Arc<SyncCoordinator>,
        sinks: StreamSinks,
    ) -> Self {
        // camera names are 1-based, matching the server naming scheme
        let name = format!("camera #{}", index + 1);
        Self {
            index,
            transport: PacketTransport::new(name.clone()),
            telemetry: Telemetry::new(name.clone(), config.telemetry_window),
            name,
            host,
            port,
            connect_retry: config.connect_retry,
            coordinator,
            sinks,
            decoder: Box::new(PassthroughDecoder),
        }
    }

    /// Replaces the payload decoder for compressed streams.
    pub fn with_decoder(mut self, decoder: Box<dyn FrameDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Runs the whole camera life cycle. The transport is closed and the
    /// final telemetry reported on every exit path.
    pub fn run(mut self) -> Result<WorkerReport> {
        let result = self.capture_loop();
        self.transport.close();
        log::info!(
            "{}: session average bandwidth {:.1} Mbps at {:.1} Hz",
            self.name,
            self.telemetry.average_bandwidth_mbps(),
            self.telemetry.average_frame_rate_hz()
        );
        let accepted_frames = result?;
        Ok(WorkerReport {
            index: self.index,
            accepted_frames,
            average_bandwidth_mbps: self.telemetry.average_bandwidth_mbps(),
            average_frame_rate_hz: self.telemetry.average_frame_rate_hz(),
        })
    }

    fn capture_loop(&mut self) -> Result<u64> {
        if !self.connect_with_retry() {
            // stop requested before the server came up
            self.coordinator.signal_end();
            self.coordinator.arrive();
            return Ok(0);
        }

        let properties = match self.handshake() {
            Ok(properties) => properties,
            Err(error) => {
                // peers are already waiting at their first rendezvous
                self.coordinator.signal_end();
                self.coordinator.arrive();
                return Err(error);
            }
        };

        let mut accepted: u64 = 0;
        let mut pending_error: Option<anyhow::Error> = None;
        let mut held_packet: Option<NetworkPacket> = None;

        loop {
            if pending_error.is_some() || self.coordinator.stop_requested() {
                self.coordinator.signal_end();
                self.coordinator.arrive();
                break;
            }

            self.telemetry.iteration_started();

            let packet = match held_packet.take() {
                Some(packet) => Some(packet),
                None => match self.transport.receive_packet() {
                    Ok(Some(packet)) => {
                        if let Err(error) =
                            self.coordinator.submit_timestamp(self.index, packet.timestamp)
                        {
                            pending_error = Some(error);
                            self.coordinator.signal_end();
                            None
                        } else {
                            Some(packet)
                        }
                    }
                    Ok(None) => {
                        log::info!("{}: stream ended by server", self.name);
                        self.coordinator.signal_end();
                        None
                    }
                    Err(error) => {
                        pending_error = Some(error);
                        self.coordinator.signal_end();
                        None
                    }
                },
            };

            // first rendezvous: every party has a packet or has signaled.
            // The ended flag is frozen for the cycle from here on.
            self.coordinator.arrive();
            if self.coordinator.ended() {
                break;
            }
            let Some(packet) = packet else {
                break;
            };

            if self.coordinator.parties() > 1 {
                let decision = self.coordinator.decide(self.index);
                // second rendezvous: all parties hold the same verdicts
                // before anyone acts on them
                self.coordinator.arrive();
                match decision {
                    Ok(SyncDecision::Proceed) => {}
                    Ok(SyncDecision::DropFrame) => {
                        log::debug!("{}: dropped a frame to catch up", self.name);
                        continue;
                    }
                    Ok(SyncDecision::AwaitPeers) => {
                        held_packet = Some(packet);
                        continue;
                    }
                    Err(error) => {
                        pending_error = Some(error);
                        continue;
                    }
                }
            }

            accepted += 1;
            let payload_len = packet.payload.len();
            if let Err(error) = self.deliver(packet, accepted, &properties) {
                pending_error = Some(error);
            }
            self.telemetry.iteration_ended(payload_len);
        }

        match pending_error {
            Some(error) => Err(error.context(format!("{}: session failed", self.name))),
            None => Ok(accepted),
        }
    }

    /// Loops until the server accepts the connection; a server that is not up
    /// yet is the expected startup condition. Returns false when a stop
    /// request arrived first.
    fn connect_with_retry(&mut self) -> bool {
        loop {
            if self.coordinator.stop_requested() {
                return false;
            }
            match self.transport.connect(&self.host, self.port) {
                Ok(()) => {
                    log::info!("{}: connected to {}:{}", self.name, self.host, self.port);
                    return true;
                }
                Err(error) => {
                    log::debug!("{}: server not reachable yet: {:#}", self.name, error);
                    thread::sleep(self.connect_retry);
                }
            }
        }
    }

    fn handshake(&mut self) -> Result<ChannelProperties> {
        let properties = self.transport.receive_metadata()?;
        self.transport.allocate_buffers()?;
        log::info!(
            "{}: {:?} channel, {}x{} at {} B/px",
            self.name,
            properties.kind,
            properties.width,
            properties.height,
            properties.bytes_per_pixel
        );
        Ok(properties)
    }

    /// Decodes and forwards one accepted frame. In pattern mode the third
    /// rendezvous always runs, even when decoding or an earlier sink failed,
    /// so the per-cycle rendezvous count stays identical across parties; the
    /// first failure is returned after the cycle is complete.
    fn deliver(
        &mut self,
        packet: NetworkPacket,
        frame_number: u64,
        properties: &ChannelProperties,
    ) -> Result<()> {
        let mut failure: Option<anyhow::Error> = None;

        let frame = match self
            .decoder
            .decode(packet.payload, properties)
            .and_then(|payload| crate::assemble(payload, properties))
        {
            Ok(frame) => Some(frame),
            Err(error) => {
                failure = Some(error);
                None
            }
        };

        if let (Some(frame), Some(recorder)) = (&frame, self.sinks.recorder.as_mut()) {
            if let Err(error) = recorder.record_frame(frame, frame_number) {
                failure.get_or_insert(error);
            }
        }

        if self.coordinator.mode() == SyncMode::PatternDetection {
            let found = match (&frame, self.sinks.pattern.as_mut()) {
                (Some(frame), Some(pattern)) => {
                    match pattern.detect_pattern(frame, frame_number) {
                        Ok(found) => found,
                        Err(error) => {
                            failure.get_or_insert(error);
                            false
                        }
                    }
                }
                _ => false,
            };
            if let Err(error) = self.coordinator.submit_pattern_found(self.index, found) {
                failure.get_or_insert(error);
            }
            // third rendezvous: commit only patterns every stream saw
            self.coordinator.arrive();
            match self.coordinator.all_found() {
                Ok(true) => {
                    if let Some(pattern) = self.sinks.pattern.as_mut() {
                        if let Err(error) = pattern.record_last_pattern() {
                            failure.get_or_insert(error);
                        }
                    }
                }
                Ok(false) => {}
                Err(error) => {
                    failure.get_or_insert(error);
                }
            }
        }

        if let (Some(frame), Some(display)) = (&frame, self.sinks.display.as_mut()) {
            if let Err(error) = display.on_frame_ready(frame) {
                failure.get_or_insert(error);
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// -------------------- Session runner --------------------

/// Start gate: spawned workers block here until every thread exists, so a
/// failed spawn can abort the whole rig before any worker touches the
/// barrier.
struct StartGate {
    released: Mutex<Option<bool>>,
    condvar: Condvar,
}

impl StartGate {
    fn new() -> Self {
        Self {
            released: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    /// Blocks until the gate opens; returns whether the session should run.
    fn wait(&self) -> bool {
        let mut released = match self.released.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        while released.is_none() {
            released = match self.condvar.wait(released) {
                Ok(guard) => guard,
                Err(_) => return false,
            };
        }
        released.unwrap_or(false)
    }

    fn release(&self, run: bool) {
        if let Ok(mut released) = self.released.lock() {
            *released = Some(run);
        }
        self.condvar.notify_all();
    }
}

/// Spawns one worker per camera, releases them together, and joins them all.
pub struct CaptureSession {
    config: RigConfig,
    coordinator: Arc<SyncCoordinator>,
}

impl CaptureSession {
    pub fn new(config: RigConfig) -> Result<Self> {
        config.validate()?;
        let mode = if config.record_pattern {
            SyncMode::PatternDetection
        } else {
            SyncMode::Plain
        };
        let coordinator = Arc::new(SyncCoordinator::new(
            config.camera_count,
            config.skew_threshold_ms,
            mode,
        ));
        Ok(Self {
            config,
            coordinator,
        })
    }

    /// Shared coordinator handle, e.g. for wiring a Ctrl-C stop request.
    pub fn coordinator(&self) -> Arc<SyncCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Runs the session against the configured server naming scheme.
    pub fn run(
        self,
        sink_factory: &dyn Fn(usize) -> Result<StreamSinks>,
    ) -> Result<Vec<WorkerReport>> {
        let endpoints = (0..self.config.camera_count)
            .map(|index| (self.config.server_host(index), self.config.port))
            .collect();
        self.run_at(endpoints, sink_factory)
    }

    /// Runs the session against explicit `(host, port)` endpoints, one per
    /// camera. Loopback rigs and tests use this directly.
    pub fn run_at(
        self,
        endpoints: Vec<(String, u16)>,
        sink_factory: &dyn Fn(usize) -> Result<StreamSinks>,
    ) -> Result<Vec<WorkerReport>> {
        if endpoints.len() != self.config.camera_count {
            return Err(anyhow!(
                "{} endpoints given for {} cameras",
                endpoints.len(),
                self.config.camera_count
            ));
        }

        // build every worker before any thread starts; a bad sink
        // configuration must fail the whole rig up front
        let mut workers = Vec::with_capacity(endpoints.len());
        for (index, (host, port)) in endpoints.into_iter().enumerate() {
            let sinks = sink_factory(index)
                .with_context(|| format!("build sinks for camera #{}", index + 1))?;
            workers.push(StreamWorker::new(
                index,
                host,
                port,
                &self.config,
                Arc::clone(&self.coordinator),
                sinks,
            ));
        }

        let gate = Arc::new(StartGate::new());
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            let worker_gate = Arc::clone(&gate);
            let name = format!("camera-{}", worker.index + 1);
            let spawned = thread::Builder::new().name(name).spawn(move || {
                if !worker_gate.wait() {
                    return None;
                }
                Some(worker.run())
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    // abort the rig: workers already spawned are still
                    // parked at the gate and exit without running
                    gate.release(false);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(anyhow!("spawn capture thread: {}", error));
                }
            }
        }
        gate.release(true);

        let mut reports = Vec::with_capacity(handles.len());
        let mut first_error: Option<anyhow::Error> = None;
        for handle in handles {
            match handle.join() {
                Ok(Some(Ok(report))) => reports.push(report),
                Ok(Some(Err(error))) => {
                    first_error.get_or_insert(error);
                }
                Ok(None) => {}
                Err(_) => {
                    first_error.get_or_insert(anyhow!("capture thread panicked"));
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => {
                reports.sort_by_key(|report| report.index);
                Ok(reports)
            }
        }
    }
}

//! End-to-end capture sessions against loopback camera servers.

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};

use rig_capture::{
    wire, CaptureSession, ChannelKind, ChannelProperties, Frame, PatternSink, RecordSink,
    RigConfig, StreamSinks, Timestamp,
};

fn ts(ms: u32) -> Timestamp {
    Timestamp::new(ms / 1000, ms % 1000)
}

fn test_config(cameras: usize) -> RigConfig {
    let mut cfg = RigConfig::default();
    cfg.camera_count = cameras;
    cfg.connect_retry = Duration::from_millis(50);
    cfg
}

/// Serves one camera connection on an ephemeral port: metadata, one
/// full-size depth frame per timestamp, then a clean close.
fn spawn_server(stamps: Vec<Timestamp>) -> (u16, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let payload =
            vec![7u8; ChannelProperties::for_kind(ChannelKind::Depth).max_payload_size()];
        let (mut stream, _) = listener.accept().unwrap();
        // the client may wind down mid-stream; write errors just end the
        // server
        if wire::write_metadata(&mut stream, ChannelKind::Depth).is_err() {
            return;
        }
        for stamp in stamps {
            if wire::write_packet(&mut stream, stamp, &payload).is_err() {
                return;
            }
        }
    });
    (port, handle)
}

/// Keeps serving frames until the client goes away; for stop-request tests.
fn spawn_endless_server() -> (u16, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let payload =
            vec![7u8; ChannelProperties::for_kind(ChannelKind::Depth).max_payload_size()];
        let (mut stream, _) = listener.accept().unwrap();
        if wire::write_metadata(&mut stream, ChannelKind::Depth).is_err() {
            return;
        }
        let mut ms = 0u32;
        loop {
            if wire::write_packet(&mut stream, ts(ms), &payload).is_err() {
                return;
            }
            ms += 33;
            thread::sleep(Duration::from_millis(1));
        }
    });
    (port, handle)
}

struct CollectingSink {
    seen: Arc<Mutex<Vec<u64>>>,
}

impl RecordSink for CollectingSink {
    fn record_frame(&mut self, _frame: &Frame, frame_number: u64) -> Result<()> {
        self.seen.lock().unwrap().push(frame_number);
        Ok(())
    }
}

struct ScriptedPatternSink {
    found_on: Vec<u64>,
    committed: Arc<Mutex<Vec<u64>>>,
    last: Option<u64>,
}

impl PatternSink for ScriptedPatternSink {
    fn detect_pattern(&mut self, _frame: &Frame, frame_number: u64) -> Result<bool> {
        if self.found_on.contains(&frame_number) {
            self.last = Some(frame_number);
            Ok(true)
        } else {
            self.last = None;
            Ok(false)
        }
    }

    fn record_last_pattern(&mut self) -> Result<()> {
        let frame_number = self
            .last
            .take()
            .ok_or_else(|| anyhow!("nothing detected this iteration"))?;
        self.committed.lock().unwrap().push(frame_number);
        Ok(())
    }
}

#[test]
fn aligned_streams_deliver_every_frame() {
    let stamps = vec![ts(100), ts(200), ts(300)];
    let (port_a, server_a) = spawn_server(stamps.clone());
    let (port_b, server_b) = spawn_server(stamps);

    let seen: Vec<Arc<Mutex<Vec<u64>>>> = (0..2).map(|_| Arc::default()).collect();
    let session = CaptureSession::new(test_config(2)).unwrap();
    let factory_seen = seen.clone();
    let reports = session
        .run_at(
            vec![
                ("127.0.0.1".to_string(), port_a),
                ("127.0.0.1".to_string(), port_b),
            ],
            &move |index| {
                Ok(StreamSinks {
                    recorder: Some(Box::new(CollectingSink {
                        seen: Arc::clone(&factory_seen[index]),
                    })),
                    ..StreamSinks::default()
                })
            },
        )
        .unwrap();

    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert_eq!(report.accepted_frames, 3);
    }
    for seen in &seen {
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }
    server_a.join().unwrap();
    server_b.join().unwrap();
}

#[test]
fn lagging_stream_is_realigned_by_dropping() {
    // camera 1 starts a stale frame behind; the coordinator must discard it
    // and realign before anything reaches the sinks
    let (port_a, server_a) = spawn_server(vec![ts(100), ts(500), ts(600)]);
    let (port_b, server_b) = spawn_server(vec![ts(500), ts(600)]);

    let seen: Vec<Arc<Mutex<Vec<u64>>>> = (0..2).map(|_| Arc::default()).collect();
    let session = CaptureSession::new(test_config(2)).unwrap();
    let factory_seen = seen.clone();
    let reports = session
        .run_at(
            vec![
                ("127.0.0.1".to_string(), port_a),
                ("127.0.0.1".to_string(), port_b),
            ],
            &move |index| {
                Ok(StreamSinks {
                    recorder: Some(Box::new(CollectingSink {
                        seen: Arc::clone(&factory_seen[index]),
                    })),
                    ..StreamSinks::default()
                })
            },
        )
        .unwrap();

    // the stale frame never reached the sinks and both workers stayed in
    // lockstep
    for report in &reports {
        assert_eq!(report.accepted_frames, 2);
    }
    for seen in &seen {
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
    server_a.join().unwrap();
    server_b.join().unwrap();
}

#[test]
fn pattern_is_recorded_only_when_every_stream_sees_it() {
    let stamps = vec![ts(100), ts(200), ts(300)];
    let (port_a, server_a) = spawn_server(stamps.clone());
    let (port_b, server_b) = spawn_server(stamps);

    let committed: Vec<Arc<Mutex<Vec<u64>>>> = (0..2).map(|_| Arc::default()).collect();
    let mut cfg = test_config(2);
    cfg.record_pattern = true;
    let session = CaptureSession::new(cfg).unwrap();

    // camera 1 sees the pattern on frames 1 and 2, camera 2 on frames 2 and
    // 3; only frame 2 is seen by every stream in the same iteration
    let scripts = [vec![1, 2], vec![2, 3]];
    let factory_committed = committed.clone();
    session
        .run_at(
            vec![
                ("127.0.0.1".to_string(), port_a),
                ("127.0.0.1".to_string(), port_b),
            ],
            &move |index| {
                Ok(StreamSinks {
                    pattern: Some(Box::new(ScriptedPatternSink {
                        found_on: scripts[index].clone(),
                        committed: Arc::clone(&factory_committed[index]),
                        last: None,
                    })),
                    ..StreamSinks::default()
                })
            },
        )
        .unwrap();

    for committed in &committed {
        assert_eq!(*committed.lock().unwrap(), vec![2]);
    }
    server_a.join().unwrap();
    server_b.join().unwrap();
}

#[test]
fn stop_request_winds_all_workers_down_together() {
    let (port_a, _server_a) = spawn_endless_server();
    let (port_b, _server_b) = spawn_endless_server();

    let session = CaptureSession::new(test_config(2)).unwrap();
    let coordinator = session.coordinator();

    let runner = thread::spawn(move || {
        session.run_at(
            vec![
                ("127.0.0.1".to_string(), port_a),
                ("127.0.0.1".to_string(), port_b),
            ],
            &|_index| Ok(StreamSinks::default()),
        )
    });

    thread::sleep(Duration::from_millis(200));
    coordinator.request_stop();

    let reports = runner.join().unwrap().unwrap();
    assert_eq!(reports.len(), 2);
    // the stop is folded into the same rendezvous cycle for everyone: no
    // worker runs a single iteration more than its peers
    assert_eq!(reports[0].accepted_frames, reports[1].accepted_frames);
}

//! Cross-stream rendezvous and the frame-drop policy.
//!
//! One `SyncCoordinator` is shared by all stream workers. Each logical frame
//! iteration runs through up to three rendezvous points on the same cyclic
//! barrier:
//!
//! 1. after every worker has received a packet (or observed end-of-stream),
//! 2. after every worker has computed the skew decision (N > 1 only),
//! 3. after pattern detection, when pattern mode is on.
//!
//! The shared state obeys one phase discipline: timestamps and the ended
//! flag are written strictly before a rendezvous and read strictly after it,
//! so every party observes the same frozen view of "who arrived with what
//! timestamp" and "has anyone ended" for the whole cycle. In particular the
//! ended flag is never set between a worker's post-rendezvous check and its
//! next arrival, which is what lets all workers terminate within a single
//! cycle instead of racing a raw boolean.
//!
//! The drop decision needs no shared flag at all: every worker computes the
//! decision for every party from the same timestamp snapshot, so the verdicts
//! agree by construction. Within one cycle either all parties proceed to the
//! sinks or none do (droppers re-receive, everyone else waits), which also
//! keeps the per-cycle rendezvous count identical across parties.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Barrier, Mutex};

use anyhow::{anyhow, Result};

use crate::Timestamp;

/// Which rendezvous schedule the rig runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Receive + skew rendezvous only.
    Plain,
    /// Adds the third rendezvous so a calibration pattern is recorded only
    /// when every stream detected it in the same iteration. Costs one extra
    /// full-barrier wait per iteration.
    PatternDetection,
}

/// Outcome of the skew decision for one worker in the current cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDecision {
    /// All streams are within the threshold; forward the frame to the sinks.
    Proceed,
    /// Own frame is too far behind the newest stream; discard it and receive
    /// a fresh one without advancing the frame counter.
    DropFrame,
    /// A peer is discarding its frame; keep the current one and rendezvous
    /// again so the peer can catch up.
    AwaitPeers,
}

pub struct SyncCoordinator {
    parties: usize,
    threshold_ms: i64,
    mode: SyncMode,
    barrier: Barrier,
    timestamps: Mutex<Vec<Timestamp>>,
    pattern_found: Mutex<Vec<bool>>,
    ended: AtomicBool,
    stop_requested: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(parties: usize, threshold_ms: i64, mode: SyncMode) -> Self {
        Self {
            parties,
            threshold_ms,
            mode,
            barrier: Barrier::new(parties),
            timestamps: Mutex::new(vec![Timestamp::default(); parties]),
            pattern_found: Mutex::new(vec![false; parties]),
            ended: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Blocks until all parties arrive, then releases them together and
    /// resets for the next cycle.
    pub fn arrive(&self) {
        self.barrier.wait();
    }

    /// Publishes this worker's newest frame timestamp. Pre-rendezvous only.
    pub fn submit_timestamp(&self, index: usize, timestamp: Timestamp) -> Result<()> {
        let mut stamps = self
            .timestamps
            .lock()
            .map_err(|_| anyhow!("coordinator timestamp lock poisoned"))?;
        let slot = stamps
            .get_mut(index)
            .ok_or_else(|| anyhow!("worker index {} out of range", index))?;
        *slot = timestamp;
        Ok(())
    }

    /// Raises the shared ended flag. Monotonic: once set it is never cleared.
    /// Must be called before arriving so peers observe it at their next
    /// post-rendezvous check.
    pub fn signal_end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    /// Whether any party has ended. Read immediately after the first
    /// rendezvous of each cycle.
    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Asks all workers to wind down cooperatively. Workers pick this up at
    /// the top of their next iteration; a worker blocked in a socket receive
    /// reacts once that receive returns.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Skew decision for `index`, computed from the snapshot published before
    /// the first rendezvous of this cycle. Every party computes the same
    /// global view, so no agreement flag is needed; the caller must still
    /// pass the second rendezvous before acting on the result.
    pub fn decide(&self, index: usize) -> Result<SyncDecision> {
        if self.parties < 2 {
            return Ok(SyncDecision::Proceed);
        }
        let stamps = self
            .timestamps
            .lock()
            .map_err(|_| anyhow!("coordinator timestamp lock poisoned"))?;
        if index >= stamps.len() {
            return Err(anyhow!("worker index {} out of range", index));
        }

        if dropping(&stamps, index, self.threshold_ms) {
            return Ok(SyncDecision::DropFrame);
        }
        if (0..self.parties).any(|party| dropping(&stamps, party, self.threshold_ms)) {
            return Ok(SyncDecision::AwaitPeers);
        }
        Ok(SyncDecision::Proceed)
    }

    /// Publishes this worker's pattern-detection verdict. Pre-rendezvous
    /// (third rendezvous) only.
    pub fn submit_pattern_found(&self, index: usize, found: bool) -> Result<()> {
        let mut flags = self
            .pattern_found
            .lock()
            .map_err(|_| anyhow!("coordinator pattern lock poisoned"))?;
        let slot = flags
            .get_mut(index)
            .ok_or_else(|| anyhow!("worker index {} out of range", index))?;
        *slot = found;
        Ok(())
    }

    /// Whether every stream detected the pattern this iteration. Read after
    /// the third rendezvous.
    pub fn all_found(&self) -> Result<bool> {
        let flags = self
            .pattern_found
            .lock()
            .map_err(|_| anyhow!("coordinator pattern lock poisoned"))?;
        Ok(flags.iter().all(|found| *found))
    }
}

/// A party drops when its frame sits further behind the newest peer frame
/// than the threshold allows. `min over peers of diff_ms(own, peer)` is 0 or
/// negative (the comparison with itself contributes 0); a value below
/// `-threshold` marks a stale frame.
fn dropping(stamps: &[Timestamp], index: usize, threshold_ms: i64) -> bool {
    let own = stamps[index];
    let min_gap = stamps
        .iter()
        .map(|other| own.diff_ms(*other))
        .min()
        .unwrap_or(0);
    min_gap < -threshold_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn ts(ms: i64) -> Timestamp {
        Timestamp::new((ms / 1000) as u32, (ms % 1000) as u32)
    }

    #[test]
    fn aligned_streams_all_proceed() {
        let coordinator = SyncCoordinator::new(3, 30, SyncMode::Plain);
        for (index, stamp) in [100, 110, 95].into_iter().enumerate() {
            coordinator.submit_timestamp(index, ts(stamp)).unwrap();
        }
        for index in 0..3 {
            assert_eq!(coordinator.decide(index).unwrap(), SyncDecision::Proceed);
        }
    }

    #[test]
    fn stale_streams_drop_and_the_ahead_stream_waits() {
        // two cameras at 100 ms, one already at 150 ms, threshold 30 ms:
        // the stale frames are discarded and re-received, the ahead camera
        // keeps its frame and waits, and nothing reaches the sinks this
        // cycle.
        let coordinator = SyncCoordinator::new(3, 30, SyncMode::Plain);
        for (index, stamp) in [100, 100, 150].into_iter().enumerate() {
            coordinator.submit_timestamp(index, ts(stamp)).unwrap();
        }
        assert_eq!(coordinator.decide(0).unwrap(), SyncDecision::DropFrame);
        assert_eq!(coordinator.decide(1).unwrap(), SyncDecision::DropFrame);
        assert_eq!(coordinator.decide(2).unwrap(), SyncDecision::AwaitPeers);
    }

    #[test]
    fn skew_at_the_threshold_is_tolerated() {
        let coordinator = SyncCoordinator::new(2, 30, SyncMode::Plain);
        coordinator.submit_timestamp(0, ts(100)).unwrap();
        coordinator.submit_timestamp(1, ts(130)).unwrap();
        assert_eq!(coordinator.decide(0).unwrap(), SyncDecision::Proceed);
        assert_eq!(coordinator.decide(1).unwrap(), SyncDecision::Proceed);
    }

    #[test]
    fn single_party_always_proceeds() {
        let coordinator = SyncCoordinator::new(1, 30, SyncMode::Plain);
        coordinator.submit_timestamp(0, ts(0)).unwrap();
        assert_eq!(coordinator.decide(0).unwrap(), SyncDecision::Proceed);
    }

    /// Drives a scripted worker loop against the coordinator: `packets` is
    /// the stream, `None` being the end-of-stream sentinel. Returns the
    /// number of frames that would have reached the sinks.
    fn scripted_worker(
        coordinator: Arc<SyncCoordinator>,
        index: usize,
        packets: Vec<Option<i64>>,
    ) -> u64 {
        let mut packets = packets.into_iter();
        let mut accepted = 0u64;
        let mut held = false;
        loop {
            if !held {
                match packets.next() {
                    Some(Some(stamp)) => {
                        coordinator.submit_timestamp(index, ts(stamp)).unwrap();
                    }
                    Some(None) | None => coordinator.signal_end(),
                }
            }
            coordinator.arrive();
            if coordinator.ended() {
                break;
            }
            let decision = coordinator.decide(index).unwrap();
            if coordinator.parties() > 1 {
                coordinator.arrive();
            }
            match decision {
                SyncDecision::DropFrame => {
                    held = false;
                    continue;
                }
                SyncDecision::AwaitPeers => {
                    held = true;
                    continue;
                }
                SyncDecision::Proceed => {
                    held = false;
                    accepted += 1;
                }
            }
        }
        accepted
    }

    #[test]
    fn end_of_stream_stops_both_workers_within_one_cycle() {
        let coordinator = Arc::new(SyncCoordinator::new(2, 30, SyncMode::Plain));
        // worker 0 ends after two frames; worker 1 would have more to offer
        let scripts = [
            vec![Some(100), Some(200), None],
            vec![Some(100), Some(200), Some(300), Some(400)],
        ];

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        for (index, script) in scripts.into_iter().enumerate() {
            let coordinator = Arc::clone(&coordinator);
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let accepted = scripted_worker(coordinator, index, script);
                tx.send((index, accepted)).unwrap();
            }));
        }
        drop(tx);

        let mut accepted = [0u64; 2];
        for _ in 0..2 {
            let (index, count) = rx
                .recv_timeout(Duration::from_secs(5))
                .expect("workers must terminate within one cycle of the sentinel");
            accepted[index] = count;
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // neither worker ran more iterations than the other after
        // termination began
        assert_eq!(accepted, [2, 2]);
    }

    #[test]
    fn lagging_stream_is_dropped_until_realigned() {
        let coordinator = Arc::new(SyncCoordinator::new(2, 30, SyncMode::Plain));
        // worker 0 starts a stale frame behind; its first frame must be
        // discarded, after which the streams run aligned
        let scripts = [
            vec![Some(100), Some(500), Some(600), None],
            vec![Some(500), Some(600)],
        ];

        let (tx, rx) = mpsc::channel();
        for (index, script) in scripts.into_iter().enumerate() {
            let coordinator = Arc::clone(&coordinator);
            let tx = tx.clone();
            thread::spawn(move || {
                let accepted = scripted_worker(coordinator, index, script);
                tx.send(accepted).unwrap();
            });
        }
        drop(tx);

        let mut counts = Vec::new();
        while let Ok(count) = rx.recv_timeout(Duration::from_secs(5)) {
            counts.push(count);
        }
        assert_eq!(counts, vec![2, 2]);
    }

    #[test]
    fn external_stop_is_latched_for_all_parties() {
        let coordinator = SyncCoordinator::new(2, 30, SyncMode::Plain);
        assert!(!coordinator.stop_requested());
        coordinator.request_stop();
        assert!(coordinator.stop_requested());
        // the ended flag is separate and still unset
        assert!(!coordinator.ended());
    }

    #[test]
    fn pattern_verdicts_require_every_stream() {
        let coordinator = SyncCoordinator::new(3, 30, SyncMode::PatternDetection);
        for index in 0..3 {
            coordinator.submit_pattern_found(index, true).unwrap();
        }
        assert!(coordinator.all_found().unwrap());
        coordinator.submit_pattern_found(1, false).unwrap();
        assert!(!coordinator.all_found().unwrap());
    }
}

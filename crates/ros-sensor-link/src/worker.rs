//! Background mesh decode worker
//!
//! A single thread pops raw messages off the inbound queue, decodes them and
//! pushes the resulting deltas onto the decoded queue in arrival order. The
//! worker is stopped cooperatively: the owner raises a stop flag and waits a
//! bounded time for the thread to notice it.

use crate::codec;
use crate::types::{MeshDelta, RawMessage};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Configuration for the decode worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long the worker blocks on the inbound queue before re-checking
    /// its stop flag
    pub poll_interval: Duration,
    /// Upper bound on how long shutdown waits for the worker to exit
    pub shutdown_timeout: Duration,
    /// Bound on queued raw messages; `None` for an unbounded queue.
    /// When full, new messages are dropped.
    pub inbound_capacity: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(1),
            inbound_capacity: None,
        }
    }
}

/// Counters shared between the enqueue handler, the worker and the owner
#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub queued: AtomicU64,
    pub dropped: AtomicU64,
    pub decoded: AtomicU64,
    pub failed: AtomicU64,
    pub blocks_decoded: AtomicU64,
    pub blocks_rejected: AtomicU64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            messages_queued: self.queued.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            messages_decoded: self.decoded.load(Ordering::Relaxed),
            messages_failed: self.failed.load(Ordering::Relaxed),
            blocks_decoded: self.blocks_decoded.load(Ordering::Relaxed),
            blocks_rejected: self.blocks_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pipeline statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Raw messages accepted onto the inbound queue
    pub messages_queued: u64,
    /// Raw messages dropped because the inbound queue was full
    pub messages_dropped: u64,
    /// Messages decoded into a delta
    pub messages_decoded: u64,
    /// Messages discarded because they could not be decoded at all
    pub messages_failed: u64,
    pub blocks_decoded: u64,
    pub blocks_rejected: u64,
}

impl WorkerStats {
    /// Queued messages the worker has not finished with yet
    pub fn pending(&self) -> u64 {
        self.messages_queued
            .saturating_sub(self.messages_decoded + self.messages_failed)
    }
}

/// Handle to a running decode thread
pub struct DecodeWorker {
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    thread: Option<thread::JoinHandle<()>>,
    name: String,
}

impl DecodeWorker {
    /// Spawn the decode thread. It runs until stopped or until every sender
    /// of `inbound` is gone.
    pub(crate) fn spawn(
        id: &str,
        inbound: Receiver<RawMessage>,
        outbound: Sender<MeshDelta>,
        config: &WorkerConfig,
        counters: Arc<PipelineCounters>,
    ) -> std::io::Result<Self> {
        let name = format!("mesh-decode-{id}");
        let stop = Arc::new(AtomicBool::new(false));
        // Never sent on; the sender dropping when the thread ends is the signal
        let (done_tx, done_rx) = bounded::<()>(0);

        let thread = {
            let stop = stop.clone();
            let poll_interval = config.poll_interval;
            thread::Builder::new().name(name.clone()).spawn(move || {
                let _done = done_tx;
                run_decode_loop(&inbound, &outbound, &stop, poll_interval, &counters);
            })?
        };

        info!("Started decode worker {}", name);
        Ok(Self {
            stop,
            done: done_rx,
            thread: Some(thread),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to exit after its current message
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stop the worker and wait at most `timeout` for it to exit.
    ///
    /// Returns `false` if the worker did not exit in time; the thread is then
    /// left detached and will exit on its own once its decode finishes.
    pub fn stop(mut self, timeout: Duration) -> bool {
        self.request_stop();
        self.wait(timeout)
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };

        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    error!("Decode worker {} panicked", self.name);
                }
                debug!("Decode worker {} stopped", self.name);
                true
            }
            Ok(()) | Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Decode worker {} did not stop within {:?}, detaching",
                    self.name, timeout
                );
                false
            }
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        self.request_stop();
    }
}

fn run_decode_loop(
    inbound: &Receiver<RawMessage>,
    outbound: &Sender<MeshDelta>,
    stop: &AtomicBool,
    poll_interval: Duration,
    counters: &PipelineCounters,
) {
    while !stop.load(Ordering::SeqCst) {
        let raw = match inbound.recv_timeout(poll_interval) {
            Ok(raw) => raw,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Inbound queue closed, decode worker exiting");
                break;
            }
        };

        let queued_for = raw.received_at.elapsed();
        match codec::decode(&raw) {
            Ok(delta) => {
                counters.blocks_decoded.fetch_add(
                    (delta.blocks.len() + delta.removed.len()) as u64,
                    Ordering::Relaxed,
                );
                counters
                    .blocks_rejected
                    .fetch_add(delta.rejected.len() as u64, Ordering::Relaxed);
                for rejection in &delta.rejected {
                    warn!(
                        "Rejected block #{} ({:?}) in message {} on {}: {}",
                        rejection.position,
                        rejection.key,
                        raw.sequence,
                        raw.topic,
                        rejection.error
                    );
                }
                trace!(
                    "Decoded message {} on {} after {:?} in queue",
                    raw.sequence,
                    raw.topic,
                    queued_for
                );

                if outbound.send(delta).is_err() {
                    debug!("Decoded queue closed, decode worker exiting");
                    break;
                }
                // Only counted once the delta is visible to the consumer
                counters.decoded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Dropping undecodable message {} on {}: {}",
                    raw.sequence, raw.topic, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use serde_json::{json, value::RawValue};
    use std::time::Instant;

    fn raw(sequence: u64, msg: serde_json::Value) -> RawMessage {
        let payload = RawValue::from_string(msg.to_string()).unwrap();
        RawMessage::new("/voxblox_node/mesh", sequence, payload)
    }

    fn removal_message(x: i64) -> serde_json::Value {
        json!({
            "block_edge_length": 1.0,
            "mesh_blocks": [{"index": [x, 0, 0], "x": [], "y": [], "z": []}]
        })
    }

    #[test]
    fn test_worker_preserves_order() {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let counters = Arc::new(PipelineCounters::default());
        let worker = DecodeWorker::spawn(
            "order",
            in_rx,
            out_tx,
            &WorkerConfig::default(),
            counters.clone(),
        )
        .unwrap();
        assert_eq!(worker.name(), "mesh-decode-order");

        for sequence in 0..20 {
            in_tx.send(raw(sequence, removal_message(sequence as i64))).unwrap();
        }

        let sequences: Vec<u64> = (0..20)
            .map(|_| out_rx.recv_timeout(Duration::from_secs(5)).unwrap().sequence)
            .collect();
        assert_eq!(sequences, (0..20).collect::<Vec<_>>());

        assert!(worker.stop(Duration::from_secs(1)));
        assert_eq!(counters.snapshot().messages_decoded, 20);
        assert_eq!(counters.snapshot().blocks_decoded, 20);
    }

    #[test]
    fn test_worker_survives_bad_messages() {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let counters = Arc::new(PipelineCounters::default());
        let worker =
            DecodeWorker::spawn("bad", in_rx, out_tx, &WorkerConfig::default(), counters.clone())
                .unwrap();

        in_tx.send(raw(0, json!({"nonsense": true}))).unwrap();
        in_tx
            .send(raw(
                1,
                json!({
                    "block_edge_length": 1.0,
                    "mesh_blocks": [
                        {"index": [0, 0], "x": [], "y": [], "z": []},
                        {"index": [1, 0, 0], "x": [], "y": [], "z": []}
                    ]
                }),
            ))
            .unwrap();

        // Only the second message produces a delta
        let delta = out_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(delta.sequence, 1);
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.rejected.len(), 1);

        assert!(worker.stop(Duration::from_secs(1)));
        let stats = counters.snapshot();
        assert_eq!(stats.messages_failed, 1);
        assert_eq!(stats.messages_decoded, 1);
        assert_eq!(stats.blocks_rejected, 1);
    }

    #[test]
    fn test_worker_stops_promptly_when_idle() {
        let (_in_tx, in_rx) = unbounded::<RawMessage>();
        let (out_tx, _out_rx) = unbounded();
        let worker = DecodeWorker::spawn(
            "idle",
            in_rx,
            out_tx,
            &WorkerConfig::default(),
            Arc::new(PipelineCounters::default()),
        )
        .unwrap();
        assert!(worker.is_running());

        let start = Instant::now();
        assert!(worker.stop(Duration::from_secs(1)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_worker_exits_when_producers_are_gone() {
        let (in_tx, in_rx) = unbounded::<RawMessage>();
        let (out_tx, _out_rx) = unbounded();
        let worker = DecodeWorker::spawn(
            "orphan",
            in_rx,
            out_tx,
            &WorkerConfig::default(),
            Arc::new(PipelineCounters::default()),
        )
        .unwrap();

        drop(in_tx);
        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_running());
    }

    #[test]
    fn test_stats_pending() {
        let stats = WorkerStats {
            messages_queued: 10,
            messages_decoded: 6,
            messages_failed: 1,
            ..Default::default()
        };
        assert_eq!(stats.pending(), 3);
    }
}

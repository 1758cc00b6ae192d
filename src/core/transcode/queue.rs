//! Bounded frame queue between realtime synthesis and the transcoder.
//!
//! Synthesis produces raw PCM faster than it can be encoded, so the two sides
//! are decoupled by a fixed-capacity FIFO. What happens when it is full is an
//! explicit [`OverflowPolicy`]:
//!
//! - `Block`: the producer waits for space. No frame is ever lost.
//! - `DropNewest`: the incoming frame is discarded and counted. The counter is
//!   reported in the turn's completion event, so loss is always observable.
//!
//! Counters follow the invariant `produced == processed + dropped` once the
//! consumer has drained the queue.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::TranscodeError;

/// Default capacity in frames
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Behaviour of [`FrameProducer::push`] on a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    #[default]
    Block,
    DropNewest,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::Block => "block",
            OverflowPolicy::DropNewest => "drop",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop" | "drop_newest" | "reject" => Ok(OverflowPolicy::DropNewest),
            other => Err(format!(
                "Unknown overflow policy '{other}', expected 'block' or 'drop'"
            )),
        }
    }
}

/// Raw PCM frame tagged with its production order
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub seq: u64,
    pub data: Bytes,
}

/// Outcome of a single push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    Dropped,
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub produced: u64,
    pub processed: u64,
    pub dropped: u64,
    pub high_water: usize,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct QueueCounters {
    produced: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    high_water: AtomicUsize,
}

impl QueueCounters {
    fn snapshot(&self, capacity: usize) -> QueueStats {
        QueueStats {
            produced: self.produced.load(Ordering::Acquire),
            processed: self.processed.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
            high_water: self.high_water.load(Ordering::Relaxed),
            capacity,
        }
    }
}

/// Create a bounded queue. `capacity` must be non-zero (enforced by config
/// validation); zero is clamped to one.
pub fn frame_queue(capacity: usize, policy: OverflowPolicy) -> (FrameProducer, FrameConsumer) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let counters = Arc::new(QueueCounters::default());
    (
        FrameProducer {
            tx,
            policy,
            capacity,
            next_seq: 0,
            counters: counters.clone(),
        },
        FrameConsumer {
            rx,
            capacity,
            counters,
        },
    )
}

/// Producer half, owned by the synthesis pump
#[derive(Debug)]
pub struct FrameProducer {
    tx: mpsc::Sender<RawFrame>,
    policy: OverflowPolicy,
    capacity: usize,
    next_seq: u64,
    counters: Arc<QueueCounters>,
}

impl FrameProducer {
    /// Enqueue a frame according to the overflow policy.
    ///
    /// Fails only when the consumer is gone.
    pub async fn push(&mut self, data: Bytes) -> Result<PushOutcome, TranscodeError> {
        let frame = RawFrame {
            seq: self.next_seq,
            data,
        };
        self.next_seq += 1;
        self.counters.produced.fetch_add(1, Ordering::AcqRel);

        let outcome = match self.policy {
            OverflowPolicy::Block => {
                self.tx
                    .send(frame)
                    .await
                    .map_err(|_| TranscodeError::QueueClosed)?;
                PushOutcome::Enqueued
            }
            OverflowPolicy::DropNewest => match self.tx.try_send(frame) {
                Ok(()) => PushOutcome::Enqueued,
                Err(TrySendError::Full(dropped)) => {
                    self.counters.dropped.fetch_add(1, Ordering::AcqRel);
                    tracing::debug!(seq = dropped.seq, "Frame queue full, dropping frame");
                    PushOutcome::Dropped
                }
                Err(TrySendError::Closed(_)) => return Err(TranscodeError::QueueClosed),
            },
        };

        if outcome == PushOutcome::Enqueued {
            let depth = self.capacity - self.tx.capacity();
            self.counters.high_water.fetch_max(depth, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot(self.capacity)
    }

    /// Counter view that stays readable after both halves are gone
    pub fn monitor(&self) -> QueueMonitor {
        QueueMonitor {
            counters: self.counters.clone(),
            capacity: self.capacity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueMonitor {
    counters: Arc<QueueCounters>,
    capacity: usize,
}

impl QueueMonitor {
    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot(self.capacity)
    }
}

/// Consumer half, owned by the transcoder
#[derive(Debug)]
pub struct FrameConsumer {
    rx: mpsc::Receiver<RawFrame>,
    capacity: usize,
    counters: Arc<QueueCounters>,
}

impl FrameConsumer {
    /// Next frame in production order, `None` once the producer is dropped
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<RawFrame> {
        let frame = self.rx.recv().await?;
        self.counters.processed.fetch_add(1, Ordering::AcqRel);
        Some(frame)
    }

    /// Frames currently waiting
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot(self.capacity)
    }
}

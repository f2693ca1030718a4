//! Result fan-in: merging per-shard event streams into one invocation.
//!
//! Each shard runs as its own invocation and emits its own lifecycle
//! events, but the original listeners expect to see exactly one. The
//! [`ShardResultForwarder`] is told up front how many shards to expect and
//! suppresses the per-shard boundaries: the first shard to start produces
//! the single `invocation_started`, the last shard to end produces the
//! single `invocation_ended` carrying run-wide elapsed time, and unit
//! events pass straight through.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::invocation::{InvocationContext, ListenerChain, RunListener};
use crate::sharding::pool::CompletionLatch;

/// Aggregate unit outcomes across every shard of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Units that finished successfully.
    pub passed: usize,
    /// Units that finished with a failure.
    pub failed: usize,
    /// Units that never got to run.
    pub not_executed: usize,
}

impl RunSummary {
    /// Total units accounted for.
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.not_executed
    }
}

/// Fan-in aggregator over the per-shard listener chains.
///
/// Shared (behind `Arc`) by every shard's chain; the retained listeners
/// behind it observe one merged invocation.
pub struct ShardResultForwarder {
    expected_shards: usize,
    retained: ListenerChain,
    started: AtomicUsize,
    ended: AtomicUsize,
    start_instant: Mutex<Option<Instant>>,
    passed: AtomicUsize,
    failed: AtomicUsize,
    not_executed: AtomicUsize,
}

impl ShardResultForwarder {
    /// Creates a forwarder expecting `expected_shards` shard streams,
    /// feeding the retained (non-shardable) listeners.
    pub fn new(expected_shards: usize, retained: Vec<Arc<dyn RunListener>>) -> Self {
        Self {
            expected_shards,
            retained: ListenerChain::new(retained),
            started: AtomicUsize::new(0),
            ended: AtomicUsize::new(0),
            start_instant: Mutex::new(None),
            passed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            not_executed: AtomicUsize::new(0),
        }
    }

    /// Snapshot of unit outcomes seen so far.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            passed: self.passed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            not_executed: self.not_executed.load(Ordering::SeqCst),
        }
    }

    /// Number of shards that have reported completion.
    pub fn shards_ended(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunListener for ShardResultForwarder {
    async fn invocation_started(&self, context: &InvocationContext) {
        if self.started.fetch_add(1, Ordering::SeqCst) == 0 {
            *self.start_instant.lock().expect("forwarder clock lock") = Some(Instant::now());
            self.retained.invocation_started(context).await;
        } else {
            debug!("suppressing repeat invocation_started from a later shard");
        }
    }

    async fn unit_started(&self, unit_id: &str) {
        self.retained.unit_started(unit_id).await;
    }

    async fn unit_passed(&self, unit_id: &str) {
        self.passed.fetch_add(1, Ordering::SeqCst);
        self.retained.unit_passed(unit_id).await;
    }

    async fn unit_failed(&self, unit_id: &str, message: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.retained.unit_failed(unit_id, message).await;
    }

    async fn unit_not_executed(&self, unit_id: &str, reason: &str) {
        self.not_executed.fetch_add(1, Ordering::SeqCst);
        self.retained.unit_not_executed(unit_id, reason).await;
    }

    async fn invocation_ended(&self, _elapsed: Duration) {
        let ended = self.ended.fetch_add(1, Ordering::SeqCst) + 1;
        if ended == self.expected_shards {
            let elapsed = self
                .start_instant
                .lock()
                .expect("forwarder clock lock")
                .map(|start| start.elapsed())
                .unwrap_or_default();
            self.retained.invocation_ended(elapsed).await;
        } else {
            debug!(ended, expected = self.expected_shards, "shard ended, run still open");
        }
    }
}

/// Observes which shard was the last to conclude.
///
/// Attached to the pre-fan-out listener set and to every shard's chain so
/// completion bookkeeping (retry orchestration, cleanup) can poll
/// [`all_shards_done`](Self::all_shards_done). Arrivals past the expected
/// count are ignored, so the double attachment is harmless.
pub struct LastShardDetector {
    latch: CompletionLatch,
}

impl LastShardDetector {
    /// Creates a detector expecting `shard_count` completions.
    pub fn new(shard_count: usize) -> Self {
        Self {
            latch: CompletionLatch::new(shard_count),
        }
    }

    /// Returns `true` once every shard has reported completion.
    pub fn all_shards_done(&self) -> bool {
        self.latch.remaining() == 0
    }
}

#[async_trait]
impl RunListener for LastShardDetector {
    async fn invocation_ended(&self, _elapsed: Duration) {
        if self.latch.arrive() {
            debug!("final shard concluded");
        }
    }
}

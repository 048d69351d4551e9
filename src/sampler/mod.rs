//! Hardware access-sample collection.
//!
//! A [`SampleSource`] opens one sample ring per (event, CPU) pair. The
//! sampling loop owns a dedicated thread that busy-polls every ring,
//! decodes and classifies a bounded batch per ring per pass, and feeds the
//! shared [`TierCounters`]. Polling instead of waiting on wakeups keeps
//! consume latency flat at the cost of one spinning core; the per-ring batch
//! cap keeps one hot ring from starving the rest of the table.

pub mod decode;
pub mod ring;
pub mod stats;

#[cfg(all(feature = "perf", target_os = "linux"))]
pub mod perf;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::tier::{NodeResolver, TierClassifier};

use self::decode::{decode_record, SampleRecord};
use self::ring::RingBufferView;
use self::stats::{SampleClass, TierCounters};

/// Hardware sampling event selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Retired load instructions.
    AllLoads,
    /// Retired store instructions.
    AllStores,
}

impl EventKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AllLoads => "all_loads",
            Self::AllStores => "all_stores",
        }
    }

    /// Raw PMU event code (event | umask) for the counter.
    pub const fn raw_config(self) -> u64 {
        match self {
            Self::AllLoads => 0x81d0,
            Self::AllStores => 0x82d0,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (event, CPU) slot in the buffer table.
///
/// `ring` is None when the source has not materialized this buffer or has
/// already torn it down; the sampling loop skips such slots.
pub struct BufferEntry {
    pub event: EventKind,
    pub cpu: u32,
    pub ring: Option<Arc<dyn RingBufferView>>,
}

/// The full table of sample buffers for one enable cycle.
#[derive(Default)]
pub struct BufferSet {
    pub entries: Vec<BufferEntry>,
}

impl BufferSet {
    /// Number of slots with a live ring.
    pub fn active(&self) -> usize {
        self.entries.iter().filter(|e| e.ring.is_some()).count()
    }
}

/// Creates and tears down hardware sample buffers.
pub trait SampleSource: Send + Sync {
    /// Open one ring per (event, cpu) pair with `pages` data pages each,
    /// sampling every `period` qualifying accesses.
    fn open(
        &self,
        events: &[EventKind],
        cpus: &[u32],
        pages: usize,
        period: u64,
    ) -> Result<BufferSet>;

    /// Tear down a buffer set returned by `open`.
    fn close(&self, set: BufferSet);
}

/// Run the sampling loop until `stop` is cancelled.
///
/// Checks the stop token once per full pass over the table, so cancellation
/// is observed within one bounded pass.
pub fn run_sampler<R: NodeResolver>(
    buffers: &BufferSet,
    classifier: &TierClassifier<R>,
    counters: &TierCounters,
    batch_size: usize,
    stop: &CancellationToken,
) {
    tracing::debug!(
        slots = buffers.entries.len(),
        active = buffers.active(),
        batch_size,
        "sampling loop running"
    );

    while !stop.is_cancelled() {
        let mut drained = 0u64;

        for entry in &buffers.entries {
            let Some(ring) = &entry.ring else {
                continue;
            };
            drained += drain_buffer(ring.as_ref(), classifier, counters, batch_size);
        }

        if drained == 0 {
            std::hint::spin_loop();
        }
    }

    tracing::debug!("sampling loop stopped");
}

/// Drain up to `batch_size` records from one ring. Returns the number of
/// records consumed.
///
/// `head` is loaded once; records published after that are left for the next
/// pass. A record whose claimed length is unusable abandons the ring for
/// this pass without advancing `tail`.
pub fn drain_buffer<R: NodeResolver>(
    ring: &dyn RingBufferView,
    classifier: &TierClassifier<R>,
    counters: &TierCounters,
    batch_size: usize,
) -> u64 {
    let head = ring.head();
    let mut tail = ring.tail();
    let mut drained = 0u64;

    while drained < batch_size as u64 && tail != head {
        let decoded = match decode_record(ring, tail) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::debug!(error = %err, "abandoning ring for this pass");
                break;
            }
        };

        let class = match decoded.record {
            SampleRecord::Access(sample) => classifier.classify(sample.physical_addr).into(),
            SampleRecord::Throttle => SampleClass::Throttled,
            SampleRecord::Other => SampleClass::Other,
        };
        counters.record(class);

        tail += decoded.len;
        ring.advance_tail(tail);
        drained += 1;
    }

    drained
}

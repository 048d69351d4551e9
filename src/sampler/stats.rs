use std::sync::atomic::{AtomicU64, Ordering};

use crate::tier::Tier;

/// Classification outcome for one consumed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleClass {
    Near,
    Far,
    Throttled,
    Other,
}

impl From<Tier> for SampleClass {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Near => Self::Near,
            Tier::Far => Self::Far,
        }
    }
}

/// Lock-free per-class sample counters.
///
/// Each class is an independent atomic; increments are relaxed and
/// `snapshot()` atomically reads and resets every field, making it suitable
/// for periodic reporting without contention. A snapshot is not transactional
/// across fields, which is acceptable because the classes are independent.
pub struct TierCounters {
    near: AtomicU64,
    far: AtomicU64,
    throttled: AtomicU64,
    other: AtomicU64,
}

/// One period's worth of counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierSnapshot {
    pub near: u64,
    pub far: u64,
    pub throttled: u64,
    pub other: u64,
}

impl TierSnapshot {
    /// Total records across all classes.
    pub fn total(&self) -> u64 {
        self.near + self.far + self.throttled + self.other
    }
}

impl TierCounters {
    /// Create a new zeroed TierCounters.
    pub fn new() -> Self {
        Self {
            near: AtomicU64::new(0),
            far: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            other: AtomicU64::new(0),
        }
    }

    /// Increment the counter for the given class by one.
    pub fn record(&self, class: SampleClass) {
        self.field(class).fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> TierSnapshot {
        TierSnapshot {
            near: self.near.swap(0, Ordering::Relaxed),
            far: self.far.swap(0, Ordering::Relaxed),
            throttled: self.throttled.swap(0, Ordering::Relaxed),
            other: self.other.swap(0, Ordering::Relaxed),
        }
    }

    /// Read all counters without resetting them.
    pub fn peek(&self) -> TierSnapshot {
        TierSnapshot {
            near: self.near.load(Ordering::Relaxed),
            far: self.far.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            other: self.other.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.near.store(0, Ordering::Relaxed);
        self.far.store(0, Ordering::Relaxed);
        self.throttled.store(0, Ordering::Relaxed);
        self.other.store(0, Ordering::Relaxed);
    }

    fn field(&self, class: SampleClass) -> &AtomicU64 {
        match class {
            SampleClass::Near => &self.near,
            SampleClass::Far => &self.far,
            SampleClass::Throttled => &self.throttled,
            SampleClass::Other => &self.other,
        }
    }
}

impl Default for TierCounters {
    fn default() -> Self {
        Self::new()
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::export::health::HealthMetrics;
use crate::sampler::stats::{TierCounters, TierSnapshot};

/// Periodic tier-count reporter.
///
/// Fires on a fixed cadence independent of the sampling loop. Each tick
/// snapshot-resets the shared counters, so every report covers one period.
/// An increment racing the reset lands in the neighboring period; the
/// reports are rate estimates, not exact accounting.
pub struct Reporter {
    interval: Duration,
    counters: Arc<TierCounters>,
    health: Arc<HealthMetrics>,
}

impl Reporter {
    /// Create a reporter over the shared counters.
    pub fn new(
        interval: Duration,
        counters: Arc<TierCounters>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            interval,
            counters,
            health,
        }
    }

    /// Spawn the reporting task. It exits when `cancel` fires; counters are
    /// left at whatever they held after the last completed tick.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            // The first tick completes immediately; consume it so the first
            // report covers a full period.
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("reporter stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let snapshot = self.counters.snapshot();
                        emit(&self.health, &snapshot);
                    }
                }
            }
        })
    }
}

/// Emit one period report to the log and health metrics.
fn emit(health: &HealthMetrics, snapshot: &TierSnapshot) {
    health
        .samples_total
        .with_label_values(&["near"])
        .inc_by(snapshot.near);
    health
        .samples_total
        .with_label_values(&["far"])
        .inc_by(snapshot.far);
    health
        .samples_total
        .with_label_values(&["throttled"])
        .inc_by(snapshot.throttled);
    health
        .samples_total
        .with_label_values(&["other"])
        .inc_by(snapshot.other);

    health
        .period_samples
        .with_label_values(&["near"])
        .set(snapshot.near as i64);
    health
        .period_samples
        .with_label_values(&["far"])
        .set(snapshot.far as i64);
    health
        .period_samples
        .with_label_values(&["throttled"])
        .set(snapshot.throttled as i64);
    health
        .period_samples
        .with_label_values(&["other"])
        .set(snapshot.other as i64);

    health.report_ticks.inc();

    info!(
        near = snapshot.near,
        far = snapshot.far,
        throttled = snapshot.throttled,
        other = snapshot.other,
        "tier sample report",
    );
}

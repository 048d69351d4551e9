//! Sampling lifecycle control.
//!
//! The [`Engine`] owns everything with a lifetime tied to the enabled state:
//! the buffer table, the sampling thread, the reporter task, and their stop
//! token. Enable and disable are idempotent; a single async mutex serializes
//! transitions so only one is ever in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::report::Reporter;
use crate::sampler::stats::{TierCounters, TierSnapshot};
use crate::sampler::{run_sampler, BufferSet, EventKind, SampleSource};
use crate::tier::{NodeResolver, TierClassifier};

/// Externally observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disabled,
    Running,
}

/// Resources owned while sampling is enabled.
struct Active {
    stop: CancellationToken,
    sampler: std::thread::JoinHandle<()>,
    reporter: tokio::task::JoinHandle<()>,
    buffers: Arc<BufferSet>,
}

/// Lifecycle controller for the sampling pipeline.
pub struct Engine {
    events: Vec<EventKind>,
    cpus: Vec<u32>,
    buffer_pages: usize,
    sample_period: u64,
    batch_size: usize,
    report_interval: Duration,

    source: Arc<dyn SampleSource>,
    classifier: Arc<TierClassifier<Arc<dyn NodeResolver>>>,
    counters: Arc<TierCounters>,
    health: Arc<HealthMetrics>,

    running: AtomicBool,
    active: tokio::sync::Mutex<Option<Active>>,
}

impl Engine {
    /// Create a disabled engine over the given collaborators.
    pub fn new(
        cfg: &Config,
        cpus: Vec<u32>,
        source: Arc<dyn SampleSource>,
        resolver: Arc<dyn NodeResolver>,
        page_shift: u32,
        health: Arc<HealthMetrics>,
    ) -> Self {
        let classifier = Arc::new(TierClassifier::new(
            resolver,
            cfg.near_node_threshold,
            page_shift,
        ));

        Self {
            events: cfg.events.clone(),
            cpus,
            buffer_pages: cfg.buffer_pages,
            sample_period: cfg.sample_period,
            batch_size: cfg.batch_size,
            report_interval: cfg.report_interval,
            source,
            classifier,
            counters: Arc::new(TierCounters::new()),
            health,
            running: AtomicBool::new(false),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Current engine state, readable without blocking on a transition.
    pub fn status(&self) -> EngineState {
        if self.running.load(Ordering::SeqCst) {
            EngineState::Running
        } else {
            EngineState::Disabled
        }
    }

    /// Counter values as of now. Valid while running and after disable,
    /// which leaves the last period's accumulation in place.
    pub fn counts(&self) -> TierSnapshot {
        self.counters.peek()
    }

    /// Start sampling. A no-op returning success when already running.
    ///
    /// On buffer allocation failure nothing is started and the engine stays
    /// disabled.
    pub async fn enable(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            debug!("sampling already enabled");
            return Ok(());
        }

        let set = self
            .source
            .open(
                &self.events,
                &self.cpus,
                self.buffer_pages,
                self.sample_period,
            )
            .context("creating sample buffers")?;
        let buffers = Arc::new(set);

        self.counters.reset();

        let stop = CancellationToken::new();

        let sampler = {
            let buffers = Arc::clone(&buffers);
            let classifier = Arc::clone(&self.classifier);
            let counters = Arc::clone(&self.counters);
            let batch_size = self.batch_size;
            let stop = stop.clone();

            std::thread::Builder::new()
                .name("tieroor-sampler".to_string())
                .spawn(move || run_sampler(&buffers, &classifier, &counters, batch_size, &stop))
        };

        let sampler = match sampler {
            Ok(handle) => handle,
            Err(e) => {
                release_buffers(&*self.source, buffers);
                return Err(e).context("spawning sampler thread");
            }
        };

        let reporter = Reporter::new(
            self.report_interval,
            Arc::clone(&self.counters),
            Arc::clone(&self.health),
        )
        .spawn(stop.child_token());

        self.health.engine_enabled.set(1);
        self.health.buffers_active.set(buffers.active() as i64);
        self.running.store(true, Ordering::SeqCst);

        info!(
            events = self.events.len(),
            cpus = self.cpus.len(),
            buffers = buffers.active(),
            "sampling enabled",
        );

        *active = Some(Active {
            stop,
            sampler,
            reporter,
            buffers,
        });

        Ok(())
    }

    /// Stop sampling. A no-op returning success when already disabled.
    ///
    /// Waits for the sampling thread to observe the stop token and exit,
    /// then stops the reporter and tears down the buffers. Counters keep
    /// their last values.
    pub async fn disable(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(active) = active.take() else {
            debug!("sampling already disabled");
            return Ok(());
        };

        active.stop.cancel();

        // The sampler never blocks, so it observes the token within one pass.
        let sampler = active.sampler;
        match tokio::task::spawn_blocking(move || sampler.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("sampler thread panicked"),
            Err(e) => warn!(error = %e, "waiting for sampler thread failed"),
        }

        if let Err(e) = active.reporter.await {
            warn!(error = %e, "reporter task join failed");
        }

        release_buffers(&*self.source, active.buffers);

        self.running.store(false, Ordering::SeqCst);
        self.health.engine_enabled.set(0);
        self.health.buffers_active.set(0);

        info!("sampling disabled");

        Ok(())
    }
}

/// Hand the buffer set back to the source once no task references it.
fn release_buffers(source: &dyn SampleSource, buffers: Arc<BufferSet>) {
    match Arc::try_unwrap(buffers) {
        Ok(set) => source.close(set),
        Err(_) => warn!("buffer set still referenced at teardown"),
    }
}

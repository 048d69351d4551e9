//! End-to-end pipeline tests over in-memory rings.
//!
//! Drives the real engine, sampling loop, decoder, classifier, and control
//! handlers against hand-built wire records, with no kernel involvement.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use tieroor::config::{Config, ControlConfig, HealthConfig};
use tieroor::control::{handle_command, render_status, ControlError};
use tieroor::engine::{Engine, EngineState};
use tieroor::export::health::HealthMetrics;
use tieroor::sampler::decode::{encode_access, encode_header, encode_throttle, AccessSample};
use tieroor::sampler::ring::{MemoryRing, RingBufferView};
use tieroor::sampler::stats::TierSnapshot;
use tieroor::sampler::{BufferEntry, BufferSet, EventKind, SampleSource};
use tieroor::tier::{NodeResolver, PfnRange, StaticNodeResolver};

/// Source handing out a fixed list of pre-built rings. Slots beyond the
/// list get no ring, mimicking buffers that were never materialized.
struct FixedSource {
    rings: Vec<Arc<MemoryRing>>,
}

impl SampleSource for FixedSource {
    fn open(
        &self,
        events: &[EventKind],
        cpus: &[u32],
        _pages: usize,
        _period: u64,
    ) -> Result<BufferSet> {
        let mut rings = self.rings.iter();
        let mut entries = Vec::new();

        for &event in events {
            for &cpu in cpus {
                entries.push(BufferEntry {
                    event,
                    cpu,
                    ring: rings
                        .next()
                        .map(|r| Arc::clone(r) as Arc<dyn RingBufferView>),
                });
            }
        }

        Ok(BufferSet { entries })
    }

    fn close(&self, _set: BufferSet) {}
}

fn test_config(report_interval: Duration) -> Config {
    Config {
        log_level: "info".to_string(),
        events: vec![EventKind::AllLoads, EventKind::AllStores],
        buffer_pages: 1,
        sample_period: 1,
        batch_size: 8,
        report_interval,
        near_node_threshold: 2,
        enable_on_start: false,
        control: ControlConfig::default(),
        health: HealthConfig::default(),
    }
}

/// Nodes 0 and 1 span pfn 0x000..0x200 (Near side of threshold 2); node 5
/// spans 0x200..0x300.
fn resolver() -> Arc<dyn NodeResolver> {
    Arc::new(StaticNodeResolver::new(vec![
        PfnRange {
            start_pfn: 0,
            end_pfn: 0x100,
            node: 0,
        },
        PfnRange {
            start_pfn: 0x100,
            end_pfn: 0x200,
            node: 1,
        },
        PfnRange {
            start_pfn: 0x200,
            end_pfn: 0x300,
            node: 5,
        },
    ]))
}

fn build_engine(
    rings: Vec<Arc<MemoryRing>>,
    report_interval: Duration,
) -> (Arc<Engine>, Arc<HealthMetrics>) {
    let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("create metrics"));
    let engine = Engine::new(
        &test_config(report_interval),
        vec![0, 1],
        Arc::new(FixedSource { rings }),
        resolver(),
        12,
        Arc::clone(&health),
    );
    (Arc::new(engine), health)
}

fn access_record(pfn: u64) -> Vec<u8> {
    encode_access(&AccessSample {
        instruction_pointer: 0x5000_1000,
        pid: 100,
        tid: 101,
        timestamp: 42,
        virtual_addr: 0x7fff_0000_0000,
        physical_addr: pfn << 12,
    })
}

async fn wait_for(engine: &Engine, pred: impl Fn(TierSnapshot) -> bool) {
    for _ in 0..1000 {
        if pred(engine.counts()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached, counts={:?}", engine.counts());
}

#[tokio::test]
async fn test_pipeline_classifies_all_record_kinds() {
    // Four slots (2 events x 2 cpus), three rings: the last slot stays
    // missing and must be skipped without error.
    let rings: Vec<_> = (0..3).map(|_| Arc::new(MemoryRing::new(4096))).collect();
    let (engine, _health) = build_engine(rings.clone(), Duration::from_secs(3600));

    engine.enable().await.expect("enable");
    assert_eq!(engine.status(), EngineState::Running);

    assert!(rings[0].produce(&access_record(0x10))); // node 0 -> near
    assert!(rings[1].produce(&access_record(0x250))); // node 5 -> far
    assert!(rings[1].produce(&encode_throttle()));
    assert!(rings[2].produce(&encode_header(99, 16).iter().copied().chain([0u8; 8]).collect::<Vec<u8>>()));

    wait_for(&engine, |c| c.total() >= 4).await;

    let counts = engine.counts();
    assert_eq!(counts.near, 1);
    assert_eq!(counts.far, 1);
    assert_eq!(counts.throttled, 1);
    assert_eq!(counts.other, 1);

    engine.disable().await.expect("disable");

    // Every produced record was consumed.
    for ring in &rings {
        assert!(ring.is_empty());
    }
}

#[tokio::test]
async fn test_counts_survive_disable_and_reset_on_enable() {
    let rings = vec![Arc::new(MemoryRing::new(4096))];
    let (engine, _health) = build_engine(rings.clone(), Duration::from_secs(3600));

    engine.enable().await.expect("enable");
    assert!(rings[0].produce(&access_record(0x10)));
    wait_for(&engine, |c| c.near == 1).await;
    engine.disable().await.expect("disable");

    // Last values are still readable while disabled.
    assert_eq!(engine.counts().near, 1);
    assert_eq!(engine.status(), EngineState::Disabled);

    // A new enable cycle starts a fresh period.
    engine.enable().await.expect("re-enable");
    assert_eq!(engine.counts().total(), 0);
    engine.disable().await.expect("disable");
}

#[tokio::test]
async fn test_corrupt_ring_does_not_stall_healthy_rings() {
    let rings: Vec<_> = (0..2).map(|_| Arc::new(MemoryRing::new(4096))).collect();
    let (engine, _health) = build_engine(rings.clone(), Duration::from_secs(3600));

    engine.enable().await.expect("enable");

    // Ring 0 leads with an unusable zero-length record; ring 1 is healthy.
    assert!(rings[0].produce(&encode_header(9, 0)));
    let corrupt_tail = rings[0].tail();
    assert!(rings[1].produce(&access_record(0x10)));
    assert!(rings[1].produce(&access_record(0x250)));

    wait_for(&engine, |c| c.near == 1 && c.far == 1).await;

    // The corrupt ring was abandoned without advancing.
    assert_eq!(rings[0].tail(), corrupt_tail);
    assert!(!rings[0].is_empty());

    engine.disable().await.expect("disable");
}

#[tokio::test]
async fn test_control_surface_lifecycle() {
    let (engine, _health) = build_engine(Vec::new(), Duration::from_secs(3600));

    assert_eq!(render_status(engine.status()), "off\n");

    // "off" while already disabled succeeds and changes nothing.
    handle_command(&engine, 0, b"off").await.expect("off");
    assert_eq!(render_status(engine.status()), "off\n");

    handle_command(&engine, 0, b"on\n").await.expect("on");
    assert_eq!(render_status(engine.status()), "on\n");

    // Repeated "on" is a no-op success.
    handle_command(&engine, 0, b"on").await.expect("second on");
    assert_eq!(render_status(engine.status()), "on\n");

    // Unknown tokens and nonzero offsets are rejected without a transition.
    let err = handle_command(&engine, 0, b"toggle").await.unwrap_err();
    assert!(matches!(err, ControlError::InvalidCommand { .. }));
    assert_eq!(render_status(engine.status()), "on\n");

    let err = handle_command(&engine, 7, b"off").await.unwrap_err();
    assert!(matches!(err, ControlError::NonzeroOffset { offset: 7 }));
    assert_eq!(render_status(engine.status()), "on\n");

    handle_command(&engine, 0, b"off").await.expect("off");
    assert_eq!(render_status(engine.status()), "off\n");
}

#[tokio::test]
async fn test_reporter_feeds_health_metrics() {
    let rings = vec![Arc::new(MemoryRing::new(4096))];
    let (engine, health) = build_engine(rings.clone(), Duration::from_millis(20));

    engine.enable().await.expect("enable");

    assert!(rings[0].produce(&access_record(0x10)));
    assert!(rings[0].produce(&access_record(0x250)));

    // Wait for at least one reporting tick to consume the counts.
    for _ in 0..1000 {
        if health.report_ticks.get() >= 1
            && health.samples_total.with_label_values(&["near"]).get() >= 1
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(health.report_ticks.get() >= 1);
    assert_eq!(health.samples_total.with_label_values(&["near"]).get(), 1);
    assert_eq!(health.samples_total.with_label_values(&["far"]).get(), 1);

    engine.disable().await.expect("disable");
}

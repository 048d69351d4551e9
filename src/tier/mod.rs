//! Physical-address → memory-tier classification.
//!
//! A sampled access is attributed to the Near (fast, local DRAM) or Far
//! (slow, expansion) tier by resolving its physical page frame to a memory
//! node and comparing the node id against the configured Near node count.

use std::fmt;

use anyhow::{Context, Result};

/// Memory tier of a sampled access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Fast, local tier (e.g. direct-attached DRAM nodes).
    Near,
    /// Slow, expansion tier (e.g. CXL-attached memory nodes).
    Far,
}

impl Tier {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Near => "near",
            Self::Far => "far",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves a page frame number to the memory node holding it.
pub trait NodeResolver: Send + Sync {
    /// Node id for `pfn`, or None when the frame is outside every known
    /// node range.
    fn node_of_pfn(&self, pfn: u64) -> Option<u32>;
}

/// Maps physical addresses to tiers.
///
/// Deterministic and infallible: a frame that resolves to no node classifies
/// as Far, so unattributable traffic is charged to the slow tier rather than
/// dropped.
pub struct TierClassifier<R> {
    resolver: R,
    near_node_threshold: u32,
    page_shift: u32,
}

impl<R: NodeResolver> TierClassifier<R> {
    /// Create a classifier. `near_node_threshold` is the count of node ids
    /// belonging to the Near tier; `page_shift` is log2 of the page size.
    pub fn new(resolver: R, near_node_threshold: u32, page_shift: u32) -> Self {
        Self {
            resolver,
            near_node_threshold,
            page_shift,
        }
    }

    /// Classify a physical address.
    pub fn classify(&self, physical_addr: u64) -> Tier {
        let pfn = physical_addr >> self.page_shift;
        match self.resolver.node_of_pfn(pfn) {
            Some(node) => self.classify_node(node),
            None => Tier::Far,
        }
    }

    /// Classify a resolved node id.
    pub fn classify_node(&self, node: u32) -> Tier {
        if node < self.near_node_threshold {
            Tier::Near
        } else {
            Tier::Far
        }
    }
}

/// Log2 of the system page size.
pub fn system_page_shift() -> u32 {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return (size as u64).trailing_zeros();
        }
    }

    // 4 KiB pages.
    12
}

/// Node resolver over a fixed list of half-open pfn ranges.
#[derive(Debug, Default, Clone)]
pub struct StaticNodeResolver {
    ranges: Vec<PfnRange>,
}

/// One node's span of page frames, `[start_pfn, end_pfn)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfnRange {
    pub start_pfn: u64,
    pub end_pfn: u64,
    pub node: u32,
}

impl StaticNodeResolver {
    /// Build a resolver from explicit ranges.
    pub fn new(ranges: Vec<PfnRange>) -> Self {
        Self { ranges }
    }
}

impl NodeResolver for StaticNodeResolver {
    fn node_of_pfn(&self, pfn: u64) -> Option<u32> {
        self.ranges
            .iter()
            .find(|r| pfn >= r.start_pfn && pfn < r.end_pfn)
            .map(|r| r.node)
    }
}

/// Node resolver backed by the kernel's per-node zone layout.
///
/// Reads `/proc/zoneinfo` once at construction and keeps the spanned pfn
/// range of every zone. Hotplug after startup is not tracked; frames in a
/// zone added later resolve to None and classify as Far.
#[derive(Debug)]
pub struct ZoneinfoNodeResolver {
    inner: StaticNodeResolver,
}

impl ZoneinfoNodeResolver {
    /// Parse node ranges from `/proc/zoneinfo`.
    pub fn from_proc() -> Result<Self> {
        let text =
            std::fs::read_to_string("/proc/zoneinfo").context("reading /proc/zoneinfo")?;
        Self::parse(&text)
    }

    /// Parse node ranges from zoneinfo-format text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut ranges = Vec::new();

        let mut node: Option<u32> = None;
        let mut spanned: Option<u64> = None;

        for line in text.lines() {
            let trimmed = line.trim();

            if let Some(rest) = trimmed.strip_prefix("Node ") {
                // "Node 0, zone   Normal" opens a new zone block.
                flush_zone(&mut ranges, node, spanned.take(), None);
                let id = rest
                    .split(',')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .parse::<u32>()
                    .with_context(|| format!("parsing node id in {trimmed:?}"))?;
                node = Some(id);
            } else if let Some(rest) = trimmed.strip_prefix("spanned") {
                spanned = rest.trim().parse::<u64>().ok();
            } else if let Some(rest) = trimmed.strip_prefix("start_pfn:") {
                let start = rest
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("parsing start_pfn in {trimmed:?}"))?;
                flush_zone(&mut ranges, node, spanned.take(), Some(start));
            }
        }

        if ranges.is_empty() {
            anyhow::bail!("no node ranges found in zoneinfo data");
        }

        tracing::debug!(zones = ranges.len(), "parsed node pfn ranges");

        Ok(Self {
            inner: StaticNodeResolver::new(ranges),
        })
    }
}

/// Record a completed zone block once its start_pfn is known.
fn flush_zone(
    ranges: &mut Vec<PfnRange>,
    node: Option<u32>,
    spanned: Option<u64>,
    start_pfn: Option<u64>,
) {
    if let (Some(node), Some(spanned), Some(start)) = (node, spanned, start_pfn) {
        if spanned > 0 {
            ranges.push(PfnRange {
                start_pfn: start,
                end_pfn: start + spanned,
                node,
            });
        }
    }
}

impl NodeResolver for ZoneinfoNodeResolver {
    fn node_of_pfn(&self, pfn: u64) -> Option<u32> {
        self.inner.node_of_pfn(pfn)
    }
}

impl<R: NodeResolver + ?Sized> NodeResolver for std::sync::Arc<R> {
    fn node_of_pfn(&self, pfn: u64) -> Option<u32> {
        (**self).node_of_pfn(pfn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_resolver() -> StaticNodeResolver {
        StaticNodeResolver::new(vec![
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
        ])
    }

    #[test]
    fn test_classify_node_threshold_boundary() {
        let classifier = TierClassifier::new(two_node_resolver(), 2, 12);

        for node in 0..2 {
            assert_eq!(classifier.classify_node(node), Tier::Near, "node {node}");
        }
        for node in 2..8 {
            assert_eq!(classifier.classify_node(node), Tier::Far, "node {node}");
        }
    }

    #[test]
    fn test_classify_address_near() {
        let classifier = TierClassifier::new(two_node_resolver(), 2, 12);
        // pfn 0x50, node 0.
        assert_eq!(classifier.classify(0x50_000), Tier::Near);
        // pfn 0x150, node 1.
        assert_eq!(classifier.classify(0x150_000), Tier::Near);
    }

    #[test]
    fn test_classify_address_far() {
        let classifier = TierClassifier::new(two_node_resolver(), 2, 12);
        // pfn 0x250, node 5.
        assert_eq!(classifier.classify(0x250_000), Tier::Far);
    }

    #[test]
    fn test_unresolvable_frame_is_far() {
        let classifier = TierClassifier::new(two_node_resolver(), 2, 12);
        // pfn 0x900 is outside every range.
        assert_eq!(classifier.classify(0x900_000), Tier::Far);
    }

    #[test]
    fn test_page_shift_applies_before_lookup() {
        let resolver = StaticNodeResolver::new(vec![PfnRange {
            start_pfn: 1,
            end_pfn: 2,
            node: 0,
        }]);
        let classifier = TierClassifier::new(resolver, 1, 16);

        // 64 KiB pages: address 0x10000 is pfn 1.
        assert_eq!(classifier.classify(0x10000), Tier::Near);
        assert_eq!(classifier.classify(0x20000), Tier::Far);
    }

    #[test]
    fn test_zoneinfo_parse() {
        let text = "\
Node 0, zone      DMA
  per-node stats
      nr_inactive_anon 10
  pages free     3840
        min      21
        spanned  4095
        present  3997
        managed  3840
  start_pfn:           1
Node 0, zone    Normal
  pages free     100000
        spanned  258048
        present  258048
  start_pfn:           4096
Node 1, zone    Normal
  pages free     200000
        spanned  524288
        present  524288
  start_pfn:           262144
";
        let resolver = ZoneinfoNodeResolver::parse(text).expect("parse zoneinfo");

        assert_eq!(resolver.node_of_pfn(1), Some(0));
        assert_eq!(resolver.node_of_pfn(5000), Some(0));
        assert_eq!(resolver.node_of_pfn(262_144), Some(1));
        assert_eq!(resolver.node_of_pfn(700_000), Some(1));
        assert_eq!(resolver.node_of_pfn(0), None);
        assert_eq!(resolver.node_of_pfn(10_000_000), None);
    }

    #[test]
    fn test_zoneinfo_parse_skips_empty_zones() {
        let text = "\
Node 0, zone  Movable
  pages free     0
        spanned  0
        present  0
  start_pfn:           0
Node 0, zone    Normal
  pages free     100
        spanned  1024
        present  1024
  start_pfn:           256
";
        let resolver = ZoneinfoNodeResolver::parse(text).expect("parse zoneinfo");
        assert_eq!(resolver.node_of_pfn(0), None);
        assert_eq!(resolver.node_of_pfn(300), Some(0));
    }

    #[test]
    fn test_zoneinfo_parse_rejects_empty_input() {
        assert!(ZoneinfoNodeResolver::parse("").is_err());
    }

    #[test]
    fn test_system_page_shift_is_sane() {
        let shift = system_page_shift();
        assert!((12..=20).contains(&shift), "shift={shift}");
    }
}

//! Linux perf_event_open sample source.
//!
//! Opens one hardware counter per (event, CPU) pair, sampling system-wide on
//! that CPU with precise (PEBS) instruction pointers and physical addresses.
//! Each counter fd gets a control page plus `pages` data pages mmap'd; the
//! kernel produces framed records into the data area and [`PerfRing`]
//! exposes it through the consumer-side [`RingBufferView`] protocol.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use super::ring::RingBufferView;
use super::{BufferEntry, BufferSet, EventKind, SampleSource};

// perf ABI constants used here.
const PERF_TYPE_RAW: u32 = 4;
const PERF_SAMPLE_IP: u64 = 1 << 0;
const PERF_SAMPLE_TID: u64 = 1 << 1;
const PERF_SAMPLE_TIME: u64 = 1 << 2;
const PERF_SAMPLE_ADDR: u64 = 1 << 3;
const PERF_SAMPLE_PHYS_ADDR: u64 = 1 << 19;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_ATTR_SIZE_VER5: u32 = 112;

// attr.flags bits: start disabled until the ring is mapped; precise_ip=2
// requests zero-skid (PEBS) sampling.
const ATTR_FLAG_DISABLED: u64 = 1 << 0;
const ATTR_PRECISE_IP_SHIFT: u32 = 15;

// data_head / data_tail live at bytes 1024 / 1032 of the control page.
const DATA_HEAD_OFFSET: usize = 1024;
const DATA_TAIL_OFFSET: usize = 1032;

/// perf_event_attr, sized to PERF_ATTR_SIZE_VER5 (matches
/// `struct perf_event_attr` in linux/perf_event.h).
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    __reserved_2: u16,
}

fn perf_event_open(
    attr: &PerfEventAttr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> libc::c_int {
    // SAFETY: attr points to a properly sized, initialized attr struct.
    unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            flags,
        ) as libc::c_int
    }
}

/// One counter's mmap'd sample ring.
///
/// The kernel writes records into the data pages and publishes `data_head`;
/// this side publishes `data_tail` after consuming. Dropping the ring unmaps
/// the region and closes the fd, which also stops the counter.
pub struct PerfRing {
    base: *mut u8,
    mmap_len: usize,
    data_offset: usize,
    capacity: usize,
    fd: libc::c_int,
}

// SAFETY: the mapping is owned exclusively by this ring for its lifetime.
// All shared-position access goes through the atomics at DATA_HEAD_OFFSET /
// DATA_TAIL_OFFSET, and the protocol guarantees the kernel (producer) never
// writes bytes the consumer has not yet released back via data_tail.
unsafe impl Send for PerfRing {}
unsafe impl Sync for PerfRing {}

impl PerfRing {
    fn head_atomic(&self) -> &AtomicU64 {
        // SAFETY: the control page is at least one page long and the offset
        // is the ABI-fixed, 8-byte-aligned location of data_head.
        unsafe { &*(self.base.add(DATA_HEAD_OFFSET) as *const AtomicU64) }
    }

    fn tail_atomic(&self) -> &AtomicU64 {
        // SAFETY: as above, for data_tail.
        unsafe { &*(self.base.add(DATA_TAIL_OFFSET) as *const AtomicU64) }
    }
}

impl RingBufferView for PerfRing {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn head(&self) -> u64 {
        self.head_atomic().load(Ordering::Acquire)
    }

    fn tail(&self) -> u64 {
        self.tail_atomic().load(Ordering::Relaxed)
    }

    fn advance_tail(&self, tail: u64) {
        self.tail_atomic().store(tail, Ordering::Release);
    }

    fn read(&self, pos: u64, out: &mut [u8]) {
        let mask = self.capacity - 1;
        let start = pos as usize & mask;
        let first = out.len().min(self.capacity - start);

        // SAFETY: start+first stays within the data pages; the tail segment
        // wraps to the start of the data area. Bounds are enforced by the
        // capacity mask and the split above.
        unsafe {
            let data = self.base.add(self.data_offset);
            std::ptr::copy_nonoverlapping(data.add(start), out.as_mut_ptr(), first);
            if first < out.len() {
                std::ptr::copy_nonoverlapping(
                    data,
                    out.as_mut_ptr().add(first),
                    out.len() - first,
                );
            }
        }
    }
}

impl Drop for PerfRing {
    fn drop(&mut self) {
        // SAFETY: base/mmap_len describe the mapping created in open_ring;
        // the fd is owned by this ring.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mmap_len);
            libc::close(self.fd);
        }
    }
}

/// Sample source backed by perf_event_open.
#[derive(Debug, Default)]
pub struct PerfSource;

impl PerfSource {
    pub fn new() -> Self {
        Self
    }
}

impl SampleSource for PerfSource {
    fn open(
        &self,
        events: &[EventKind],
        cpus: &[u32],
        pages: usize,
        period: u64,
    ) -> Result<BufferSet> {
        let page_size = page_size()?;
        let mut entries = Vec::with_capacity(events.len() * cpus.len());

        for &event in events {
            for &cpu in cpus {
                let ring = open_ring(event, cpu, pages, period, page_size).with_context(
                    || format!("opening {event} sample buffer on cpu {cpu}"),
                )?;

                entries.push(BufferEntry {
                    event,
                    cpu,
                    ring: Some(Arc::new(ring)),
                });
            }
        }

        tracing::info!(
            buffers = entries.len(),
            pages,
            period,
            "perf sample buffers opened",
        );

        Ok(BufferSet { entries })
    }

    fn close(&self, set: BufferSet) {
        let count = set.active();
        drop(set);
        tracing::info!(buffers = count, "perf sample buffers closed");
    }
}

/// Open, map, and start one counter.
fn open_ring(
    event: EventKind,
    cpu: u32,
    pages: usize,
    period: u64,
    page_size: usize,
) -> Result<PerfRing> {
    let attr = PerfEventAttr {
        type_: PERF_TYPE_RAW,
        size: PERF_ATTR_SIZE_VER5,
        config: event.raw_config(),
        sample_period: period,
        sample_type: PERF_SAMPLE_IP
            | PERF_SAMPLE_TID
            | PERF_SAMPLE_TIME
            | PERF_SAMPLE_ADDR
            | PERF_SAMPLE_PHYS_ADDR,
        flags: ATTR_FLAG_DISABLED | (2u64 << ATTR_PRECISE_IP_SHIFT),
        ..PerfEventAttr::default()
    };

    // All processes, one CPU.
    let fd = perf_event_open(&attr, -1, cpu as libc::c_int, -1, PERF_FLAG_FD_CLOEXEC);
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("perf_event_open");
    }

    let mmap_len = (1 + pages) * page_size;
    // SAFETY: fd is a valid perf event fd and mmap_len is 1 control page
    // plus a power-of-two number of data pages, as the ABI requires.
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            mmap_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        let err = io::Error::last_os_error();
        // SAFETY: fd was just opened above.
        unsafe { libc::close(fd) };
        return Err(err).context("mapping sample pages");
    }

    let ring = PerfRing {
        base: base as *mut u8,
        mmap_len,
        data_offset: page_size,
        capacity: pages * page_size,
        fd,
    };

    // SAFETY: fd is owned by ring; ENABLE takes no argument payload.
    if unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ENABLE as _, 0) } != 0 {
        return Err(io::Error::last_os_error()).context("starting counter");
    }

    Ok(ring)
}

fn page_size() -> Result<usize> {
    // SAFETY: sysconf is always safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        bail!("querying system page size failed");
    }
    Ok(size as usize)
}

/// CPUs currently online, from the kernel's cpu mask list.
pub fn online_cpus() -> Result<Vec<u32>> {
    let text = std::fs::read_to_string("/sys/devices/system/cpu/online")
        .context("reading online cpu list")?;
    parse_cpu_list(text.trim())
}

/// Parse a kernel cpu list ("0-3", "0-3,8-11", "0,2,4").
fn parse_cpu_list(text: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();

    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo
                    .trim()
                    .parse()
                    .with_context(|| format!("parsing cpu range {part:?}"))?;
                let hi: u32 = hi
                    .trim()
                    .parse()
                    .with_context(|| format!("parsing cpu range {part:?}"))?;
                if hi < lo {
                    bail!("inverted cpu range {part:?}");
                }
                cpus.extend(lo..=hi);
            }
            None => {
                let cpu = part
                    .parse()
                    .with_context(|| format!("parsing cpu id {part:?}"))?;
                cpus.push(cpu);
            }
        }
    }

    if cpus.is_empty() {
        bail!("empty cpu list");
    }

    Ok(cpus)
}

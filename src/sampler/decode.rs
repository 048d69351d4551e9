//! Decoding of framed sample records out of a ring buffer.
//!
//! Records use the kernel's perf framing: an 8-byte header carrying a kind
//! tag and the total record length, followed by a kind-specific payload. The
//! header length is authoritative for advancing the consumer position, even
//! for kinds this decoder does not recognize.

use thiserror::Error;

use super::ring::RingBufferView;

/// Record header size in bytes: kind (u32), misc (u16), size (u16).
pub const HEADER_SIZE: usize = 8;

/// Access sample payload size: ip, pid, tid, time, addr, phys_addr.
pub const ACCESS_PAYLOAD_SIZE: usize = 40;

/// Total encoded size of a well-formed access sample.
pub const ACCESS_RECORD_SIZE: usize = HEADER_SIZE + ACCESS_PAYLOAD_SIZE;

// Header kind tags (perf ABI values).
pub const RECORD_THROTTLE: u32 = 5;
pub const RECORD_UNTHROTTLE: u32 = 6;
pub const RECORD_SAMPLE: u32 = 9;

/// One memory-access sample captured by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessSample {
    pub instruction_pointer: u64,
    pub pid: u32,
    pub tid: u32,
    pub timestamp: u64,
    pub virtual_addr: u64,
    pub physical_addr: u64,
}

/// A decoded ring buffer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRecord {
    /// A classified memory access.
    Access(AccessSample),
    /// The sampling hardware throttled or unthrottled itself.
    Throttle,
    /// Any other record kind, including recognizable kinds with a payload
    /// shorter than their layout requires.
    Other,
}

/// A record plus the encoded length to advance the consumer position by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub record: SampleRecord,
    pub len: u64,
}

/// Errors that make a record unusable for consumption.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The claimed length cannot advance the consumer: zero would loop
    /// forever, over-capacity would pass the producer.
    #[error("record at offset {pos} claims unusable length {len} (capacity {capacity})")]
    BadLength { pos: u64, len: u32, capacity: usize },
}

/// Decode one record at absolute position `pos`.
///
/// Pure read; the consumer position is not touched. The caller must have
/// observed `head > pos` before calling.
pub fn decode_record(ring: &dyn RingBufferView, pos: u64) -> Result<Decoded, DecodeError> {
    let mut header = [0u8; HEADER_SIZE];
    ring.read(pos, &mut header);

    let kind = read_u32_le(&header, 0);
    let size = read_u16_le(&header, 6) as u32;

    if size == 0 || size as usize > ring.capacity() {
        return Err(DecodeError::BadLength {
            pos,
            len: size,
            capacity: ring.capacity(),
        });
    }

    let record = match kind {
        RECORD_SAMPLE if size as usize >= ACCESS_RECORD_SIZE => {
            let mut payload = [0u8; ACCESS_PAYLOAD_SIZE];
            ring.read(pos + HEADER_SIZE as u64, &mut payload);

            SampleRecord::Access(AccessSample {
                instruction_pointer: read_u64_le(&payload, 0),
                pid: read_u32_le(&payload, 8),
                tid: read_u32_le(&payload, 12),
                timestamp: read_u64_le(&payload, 16),
                virtual_addr: read_u64_le(&payload, 24),
                physical_addr: read_u64_le(&payload, 32),
            })
        }
        RECORD_THROTTLE | RECORD_UNTHROTTLE => SampleRecord::Throttle,
        _ => SampleRecord::Other,
    };

    Ok(Decoded {
        record,
        len: u64::from(size),
    })
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

// ---------------------------------------------------------------------------
// Wire encoding helpers, shared with tests and simulations
// ---------------------------------------------------------------------------

/// Encode a record header.
pub fn encode_header(kind: u32, size: u16) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&kind.to_le_bytes());
    // misc is left zero.
    header[6..8].copy_from_slice(&size.to_le_bytes());
    header
}

/// Encode a complete access sample record.
pub fn encode_access(sample: &AccessSample) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ACCESS_RECORD_SIZE);
    buf.extend_from_slice(&encode_header(RECORD_SAMPLE, ACCESS_RECORD_SIZE as u16));
    buf.extend_from_slice(&sample.instruction_pointer.to_le_bytes());
    buf.extend_from_slice(&sample.pid.to_le_bytes());
    buf.extend_from_slice(&sample.tid.to_le_bytes());
    buf.extend_from_slice(&sample.timestamp.to_le_bytes());
    buf.extend_from_slice(&sample.virtual_addr.to_le_bytes());
    buf.extend_from_slice(&sample.physical_addr.to_le_bytes());
    buf
}

/// Encode a throttle notification record.
pub fn encode_throttle() -> Vec<u8> {
    encode_header(RECORD_THROTTLE, HEADER_SIZE as u16).to_vec()
}

//! Framing of the i915 perf record stream.
//!
//! A block is a packed sequence of records, each starting with a
//! [`RecordHeader`] whose `size` covers the header and payload. Sample
//! payloads carry optional GPU and CPU timestamps followed by one raw OA
//! report, as selected by [`RecordConfig`].

use plain::Plain;
use thiserror::Error;

pub const HEADER_SIZE: usize = std::mem::size_of::<RecordHeader>();

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

unsafe impl Plain for RecordHeader {}

impl RecordHeader {
    pub fn new(kind: RecordKind, size: u16) -> Self {
        RecordHeader {
            kind: kind as u32,
            misc: 0,
            size,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.kind.to_ne_bytes());
        bytes[4..6].copy_from_slice(&self.misc.to_ne_bytes());
        bytes[6..8].copy_from_slice(&self.size.to_ne_bytes());
        bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordKind {
    Sample = 1,
    OaReportLost = 2,
    OaBufferLost = 3,
}

impl TryFrom<u32> for RecordKind {
    type Error = u32;

    fn try_from(kind: u32) -> Result<Self, u32> {
        match kind {
            1 => Ok(RecordKind::Sample),
            2 => Ok(RecordKind::OaReportLost),
            3 => Ok(RecordKind::OaBufferLost),
            other => Err(other),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record at offset {offset} has size {size}, smaller than a header")]
    Undersized { offset: usize, size: usize },
    #[error("record at offset {offset} with size {size} overruns the {len} byte block")]
    Overrun {
        offset: usize,
        size: usize,
        len: usize,
    },
    #[error("unknown record type {kind} at offset {offset}")]
    UnknownType { kind: u32, offset: usize },
    #[error("sample at offset {offset} is {size} bytes, expected at least {expected}")]
    ShortSample {
        offset: usize,
        size: usize,
        expected: usize,
    },
}

/// Which optional fields precede the OA report in a sample record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordConfig {
    pub gpu_timestamps: bool,
    pub cpu_timestamps: bool,
    pub report_size: usize,
}

impl Default for RecordConfig {
    fn default() -> Self {
        RecordConfig {
            gpu_timestamps: false,
            cpu_timestamps: false,
            report_size: crate::oa::OA_REPORT_SIZE,
        }
    }
}

impl RecordConfig {
    fn gpu_timestamp_offset(&self) -> Option<usize> {
        self.gpu_timestamps.then_some(HEADER_SIZE)
    }

    fn cpu_timestamp_offset(&self) -> Option<usize> {
        self.cpu_timestamps
            .then_some(HEADER_SIZE + if self.gpu_timestamps { 8 } else { 0 })
    }

    fn report_offset(&self) -> usize {
        HEADER_SIZE
            + if self.gpu_timestamps { 8 } else { 0 }
            + if self.cpu_timestamps { 8 } else { 0 }
    }

    /// Size of a sample record carrying every configured field.
    pub fn sample_size(&self) -> usize {
        self.report_offset() + self.report_size
    }

    pub fn oa_report<'a>(&self, record: &'a [u8]) -> Option<&'a [u8]> {
        let start = self.report_offset();
        record.get(start..start + self.report_size)
    }

    pub fn gpu_timestamp(&self, record: &[u8]) -> Option<u64> {
        self.gpu_timestamp_offset().and_then(|o| read_u64(record, o))
    }

    pub fn cpu_timestamp(&self, record: &[u8]) -> Option<u64> {
        self.cpu_timestamp_offset().and_then(|o| read_u64(record, o))
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let mut value = [0u8; 8];
    value.copy_from_slice(bytes.get(offset..offset + 8)?);
    Some(u64::from_ne_bytes(value))
}

/// One framed record inside a block.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub offset: usize,
    pub header: RecordHeader,
    pub kind: RecordKind,
    /// Header and payload.
    pub bytes: &'a [u8],
}

/// Iterator over the records of a block. Stops after the first error.
pub struct Records<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

pub fn records(data: &[u8]) -> Records<'_> {
    Records {
        data,
        offset: 0,
        failed: false,
    }
}

impl<'a> Records<'a> {
    fn next_record(&mut self) -> Result<Record<'a>, RecordError> {
        let offset = self.offset;
        let len = self.data.len();

        let mut header = RecordHeader::default();
        if plain::copy_from_bytes(&mut header, &self.data[offset..]).is_err() {
            return Err(RecordError::Overrun {
                offset,
                size: HEADER_SIZE,
                len,
            });
        }

        let size = header.size as usize;
        if size < HEADER_SIZE {
            return Err(RecordError::Undersized { offset, size });
        }
        if offset + size > len {
            return Err(RecordError::Overrun { offset, size, len });
        }

        let kind = RecordKind::try_from(header.kind)
            .map_err(|kind| RecordError::UnknownType { kind, offset })?;

        self.offset += size;
        Ok(Record {
            offset,
            header,
            kind,
            bytes: &self.data[offset..offset + size],
        })
    }
}

/// Length of the prefix of `data` made of whole records.
///
/// A record cut off by the end of `data` is left out so it can be joined
/// with the next block. An undersized header is kept for [`records`] to
/// report.
pub fn complete_len(data: &[u8]) -> usize {
    let mut offset = 0;
    while offset < data.len() {
        let mut header = RecordHeader::default();
        if plain::copy_from_bytes(&mut header, &data[offset..]).is_err() {
            return offset;
        }
        let size = header.size as usize;
        if size < HEADER_SIZE {
            return data.len();
        }
        if offset + size > data.len() {
            return offset;
        }
        offset += size;
    }
    offset
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        let record = self.next_record();
        self.failed = record.is_err();
        Some(record)
    }
}

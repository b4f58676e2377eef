//! Capture files: transport payloads recorded back to back, each preceded
//! by its length as a little-endian u32.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

const LENGTH_SIZE: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("truncated length at offset {offset}")]
    TruncatedLength { offset: usize },
    #[error("payload at offset {offset} claims {len} bytes, only {available} left")]
    TruncatedPayload {
        offset: usize,
        len: usize,
        available: usize,
    },
}

/// Iterator over the payloads of a capture. Stops after the first error.
pub struct Payloads<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

pub fn payloads(data: &[u8]) -> Payloads<'_> {
    Payloads {
        data,
        offset: 0,
        failed: false,
    }
}

impl<'a> Iterator for Payloads<'a> {
    type Item = Result<&'a [u8], CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        let offset = self.offset;
        let Some(len) = self.data.get(offset..offset + LENGTH_SIZE) else {
            self.failed = true;
            return Some(Err(CaptureError::TruncatedLength { offset }));
        };
        let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;

        let start = offset + LENGTH_SIZE;
        let Some(payload) = self.data.get(start..start + len) else {
            self.failed = true;
            return Some(Err(CaptureError::TruncatedPayload {
                offset,
                len,
                available: self.data.len() - start,
            }));
        };

        self.offset = start + len;
        Some(Ok(payload))
    }
}

pub fn read_capture(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading capture {}", path.display()))
}

pub struct CaptureWriter {
    out: BufWriter<File>,
}

impl CaptureWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("creating capture {}", path.display()))?;
        Ok(CaptureWriter {
            out: BufWriter::new(file),
        })
    }

    pub fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).context("payload too large for a capture")?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(payload)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.out.flush().context("flushing capture")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_capture() {
        let mut data = 3u32.to_le_bytes().to_vec();
        data.extend([1, 2, 3]);
        data.extend(10u32.to_le_bytes());
        data.extend([4, 5]);

        let mut iter = payloads(&data);
        assert_eq!(iter.next(), Some(Ok(&[1u8, 2, 3][..])));
        assert_eq!(
            iter.next(),
            Some(Err(CaptureError::TruncatedPayload {
                offset: 7,
                len: 10,
                available: 2,
            }))
        );
        assert_eq!(iter.next(), None);

        let mut iter = payloads(&[0, 0]);
        assert_eq!(iter.next(), Some(Err(CaptureError::TruncatedLength { offset: 0 })));
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");

        let mut writer = CaptureWriter::create(&path).unwrap();
        writer.write_payload(b"first").unwrap();
        writer.write_payload(b"").unwrap();
        writer.finish().unwrap();

        let data = read_capture(&path).unwrap();
        let all: Vec<_> = payloads(&data).map(Result::unwrap).collect();
        assert_eq!(all, vec![&b"first"[..], &b""[..]]);
    }
}

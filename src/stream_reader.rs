//! Compressed byte sources.
//!
//! The codestream layer reads through the [`CompressedSource`] trait so that the same
//! tile-part and packet parsing code serves in-memory buffers, files and non-seekable
//! streams alike.

use crate::error::J2kError;
use crate::jpeg_marker_code::MarkerCode;
use std::io::{Read, Seek, SeekFrom};

pub trait CompressedSource: Send {
    /// Reads up to `buf.len()` bytes, returning how many were read. Zero means end of data.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, J2kError>;

    /// Moves to an absolute address. Fails on sources without random access.
    fn seek(&mut self, address: u64) -> Result<(), J2kError>;

    fn position(&self) -> u64;

    fn supports_seek(&self) -> bool;

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), J2kError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(J2kError::UnexpectedEnd);
            }
            filled += n;
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, J2kError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_u16(&mut self) -> Result<u16, J2kError> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    fn read_u32(&mut self) -> Result<u32, J2kError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn read_u64(&mut self) -> Result<u64, J2kError> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    /// Reads `len` bytes into a fresh buffer, stopping early at end of data.
    fn read_up_to(&mut self, len: usize) -> Result<Vec<u8>, J2kError> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.read(&mut out[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }

    /// Skips `count` bytes by reading them when seeking is not available.
    fn skip(&mut self, count: u64) -> Result<(), J2kError> {
        if self.supports_seek() {
            let target = self.position() + count;
            return self.seek(target);
        }
        let mut scratch = [0u8; 512];
        let mut left = count;
        while left > 0 {
            let chunk = left.min(scratch.len() as u64) as usize;
            self.read_exact(&mut scratch[..chunk])?;
            left -= chunk as u64;
        }
        Ok(())
    }

    /// Reads a two-byte marker and checks it against `expected`.
    fn expect_marker(&mut self, expected: MarkerCode) -> Result<(), J2kError> {
        let found = self.read_u16()?;
        if found != u16::from(expected) {
            return Err(J2kError::MarkerMismatch {
                expected: expected.into(),
                found,
            });
        }
        Ok(())
    }
}

/// Seekable source over an owned buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Vec<u8>,
    position: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining_data(&self) -> &[u8] {
        &self.data[self.position.min(self.data.len())..]
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl CompressedSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, J2kError> {
        let remaining = self.remaining_data();
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }

    fn seek(&mut self, address: u64) -> Result<(), J2kError> {
        if address > self.data.len() as u64 {
            return Err(J2kError::UnexpectedEnd);
        }
        self.position = address as usize;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn supports_seek(&self) -> bool {
        true
    }
}

/// Wraps any source and hides its random access, as a network stream would.
pub struct SequentialSource<S: CompressedSource> {
    inner: S,
}

impl<S: CompressedSource> SequentialSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: CompressedSource> CompressedSource for SequentialSource<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, J2kError> {
        self.inner.read(buf)
    }

    fn seek(&mut self, _address: u64) -> Result<(), J2kError> {
        Err(J2kError::InvalidOperation("source does not support seeking"))
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn supports_seek(&self) -> bool {
        false
    }
}

/// Source backed by any `Read + Seek` value such as a file.
pub struct IoSource<R: Read + Seek + Send> {
    inner: R,
    position: u64,
}

impl<R: Read + Seek + Send> IoSource<R> {
    pub fn new(mut inner: R) -> Result<Self, J2kError> {
        let position = inner.stream_position()?;
        Ok(Self { inner, position })
    }
}

impl<R: Read + Seek + Send> CompressedSource for IoSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, J2kError> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn seek(&mut self, address: u64) -> Result<(), J2kError> {
        self.position = self.inner.seek(SeekFrom::Start(address))?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn supports_seek(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_reads_big_endian() {
        let mut src = MemorySource::new(vec![0xFF, 0x90, 0x00, 0x0A, 1, 2, 3, 4]);
        src.expect_marker(MarkerCode::StartOfTile).unwrap();
        assert_eq!(src.read_u16().unwrap(), 10);
        assert_eq!(src.read_u32().unwrap(), 0x01020304);
        assert_eq!(src.read_u8(), Err(J2kError::UnexpectedEnd));
    }

    #[test]
    fn test_sequential_source_refuses_seek() {
        let mut src = SequentialSource::new(MemorySource::new(vec![0; 16]));
        assert!(!src.supports_seek());
        assert!(src.seek(4).is_err());
        src.skip(10).unwrap();
        assert_eq!(src.position(), 10);
    }

    #[test]
    fn test_marker_mismatch() {
        let mut src = MemorySource::new(vec![0xFF, 0x92]);
        let err = src.expect_marker(MarkerCode::StartOfPacket).unwrap_err();
        assert_eq!(
            err,
            J2kError::MarkerMismatch {
                expected: 0xFF91,
                found: 0xFF92
            }
        );
    }
}

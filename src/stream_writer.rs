//! Compressed byte targets.

use crate::error::J2kError;
use crate::jpeg_marker_code::MarkerCode;
use std::io::Write;

pub trait CompressedTarget: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), J2kError>;

    /// Number of bytes written so far.
    fn position(&self) -> u64;

    fn write_u8(&mut self, value: u8) -> Result<(), J2kError> {
        self.write(&[value])
    }

    fn write_u16(&mut self, value: u16) -> Result<(), J2kError> {
        self.write(&value.to_be_bytes())
    }

    fn write_u32(&mut self, value: u32) -> Result<(), J2kError> {
        self.write(&value.to_be_bytes())
    }

    fn write_u64(&mut self, value: u64) -> Result<(), J2kError> {
        self.write(&value.to_be_bytes())
    }

    fn write_marker(&mut self, marker: MarkerCode) -> Result<(), J2kError> {
        self.write(&marker.to_bytes())
    }
}

/// Growable in-memory target.
#[derive(Debug, Default, Clone)]
pub struct MemoryTarget {
    data: Vec<u8>,
    limit: Option<usize>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// A target that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit: Some(limit),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl CompressedTarget for MemoryTarget {
    fn write(&mut self, data: &[u8]) -> Result<(), J2kError> {
        if let Some(limit) = self.limit {
            if self.data.len() + data.len() > limit {
                return Err(J2kError::DestinationTooSmall);
            }
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Discards everything, keeping only the byte count.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountingTarget {
    count: u64,
}

impl CountingTarget {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompressedTarget for CountingTarget {
    fn write(&mut self, data: &[u8]) -> Result<(), J2kError> {
        self.count += data.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.count
    }
}

/// Target backed by any `std::io::Write`, such as a file.
pub struct IoTarget<W: Write + Send> {
    inner: W,
    count: u64,
}

impl<W: Write + Send> IoTarget<W> {
    /// `start` is the number of bytes already present, used when appending to a fragment.
    pub fn new(inner: W, start: u64) -> Self {
        Self {
            inner,
            count: start,
        }
    }

    pub fn into_inner(mut self) -> Result<W, J2kError> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write + Send> CompressedTarget for IoTarget<W> {
    fn write(&mut self, data: &[u8]) -> Result<(), J2kError> {
        self.inner.write_all(data)?;
        self.count += data.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_target_limit() {
        let mut t = MemoryTarget::with_limit(3);
        t.write_u16(0xFF90).unwrap();
        assert_eq!(t.write_u16(1), Err(J2kError::DestinationTooSmall));
        assert_eq!(t.as_slice(), &[0xFF, 0x90]);
    }

    #[test]
    fn test_counting_target() {
        let mut t = CountingTarget::new();
        t.write_marker(MarkerCode::StartOfData).unwrap();
        t.write_u32(7).unwrap();
        assert_eq!(t.position(), 6);
    }
}

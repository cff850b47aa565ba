//! Packet header bit I/O.
//!
//! Packet headers are packed most significant bit first. After an 0xFF byte the next
//! byte only carries 7 bits (its MSB is a stuffed zero), so that no marker code can
//! appear inside a header.

use crate::error::J2kError;
use crate::jpeg_marker_code::is_marker_pair;

pub struct J2kBitReader<'a> {
    data: &'a [u8],
    pos: usize,
    bit_buffer: u8,
    bits_left: u8,
    last_was_ff: bool,
}

impl<'a> J2kBitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            bit_buffer: 0,
            bits_left: 0,
            last_was_ff: false,
        }
    }

    pub fn read_bit(&mut self) -> Result<u8, J2kError> {
        if self.bits_left == 0 {
            let b = *self.data.get(self.pos).ok_or(J2kError::UnexpectedEnd)?;
            if self.last_was_ff && is_marker_pair(0xFF, b) {
                return Err(J2kError::MalformedPacketHeader(format!(
                    "marker 0xFF{b:02X} inside packet header"
                )));
            }
            self.pos += 1;
            self.bits_left = if self.last_was_ff { 7 } else { 8 };
            self.last_was_ff = b == 0xFF;
            self.bit_buffer = b;
        }

        let bit = (self.bit_buffer >> (self.bits_left - 1)) & 1;
        self.bits_left -= 1;
        Ok(bit)
    }

    pub fn read_bits(&mut self, mut count: u8) -> Result<u32, J2kError> {
        debug_assert!(count <= 32);
        let mut bits = 0u32;
        while count > 0 {
            let bit = self.read_bit()?;
            bits = (bits << 1) | (bit as u32);
            count -= 1;
        }
        Ok(bits)
    }

    /// Discards the rest of the current byte, plus the stuffed byte following a final 0xFF.
    pub fn align(&mut self) {
        self.bits_left = 0;
        if self.last_was_ff {
            if self.pos < self.data.len() {
                self.pos += 1;
            }
            self.last_was_ff = false;
        }
    }

    pub fn has_data(&self) -> bool {
        self.pos < self.data.len() || self.bits_left > 0
    }

    /// Bytes consumed so far. After [`J2kBitReader::align`] this is the header length.
    pub fn position(&self) -> usize {
        self.pos
    }
}

#[derive(Debug, Clone)]
pub struct J2kBitWriter {
    data: Vec<u8>,
    bit_buffer: u8,
    bits_count: u8,
    capacity: u8,
}

impl Default for J2kBitWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl J2kBitWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            bit_buffer: 0,
            bits_count: 0,
            capacity: 8,
        }
    }

    pub fn write_bit(&mut self, bit: u8) {
        self.bit_buffer = (self.bit_buffer << 1) | (bit & 1);
        self.bits_count += 1;
        if self.bits_count == self.capacity {
            self.flush_byte();
        }
    }

    pub fn write_bits(&mut self, value: u32, count: u8) {
        for i in (0..count).rev() {
            self.write_bit(((value >> i) & 1) as u8);
        }
    }

    fn flush_byte(&mut self) {
        let b = self.bit_buffer;
        self.data.push(b);
        self.capacity = if b == 0xFF { 7 } else { 8 };
        self.bit_buffer = 0;
        self.bits_count = 0;
    }

    /// Number of bytes [`J2kBitWriter::finish`] would return.
    pub fn finished_len(&self) -> usize {
        let mut len = self.data.len();
        let mut last = self.data.last().copied();
        if self.bits_count > 0 {
            len += 1;
            last = Some(self.bit_buffer << (self.capacity - self.bits_count));
        }
        if last == Some(0xFF) {
            len += 1;
        }
        len
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.bits_count > 0 {
            self.bit_buffer <<= self.capacity - self.bits_count;
            self.flush_byte();
        }
        if self.data.last() == Some(&0xFF) {
            self.data.push(0x00);
        }
        self.data
    }

    pub fn get_output(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stuffing_after_ff() {
        let mut w = J2kBitWriter::new();
        w.write_bits(0xFF, 8);
        // Seven bits fill the stuffed byte.
        w.write_bits(0x7F, 7);
        w.write_bit(1);
        let len = w.finished_len();
        let out = w.finish();
        assert_eq!(out, vec![0xFF, 0x7F, 0x80]);
        assert_eq!(len, 3);

        let mut r = J2kBitReader::new(&out);
        assert_eq!(r.read_bits(8).unwrap(), 0xFF);
        assert_eq!(r.read_bits(7).unwrap(), 0x7F);
        assert_eq!(r.read_bit().unwrap(), 1);
    }

    #[test]
    fn test_trailing_ff_gets_zero_byte() {
        let mut w = J2kBitWriter::new();
        w.write_bits(0xFF, 8);
        assert_eq!(w.finished_len(), 2);
        let out = w.finish();
        assert_eq!(out, vec![0xFF, 0x00]);

        let mut r = J2kBitReader::new(&out);
        r.read_bits(8).unwrap();
        r.align();
        assert_eq!(r.position(), 2);
    }

    #[test]
    fn test_marker_inside_header_is_rejected() {
        let data = [0xFF, 0x91, 0x00];
        let mut r = J2kBitReader::new(&data);
        r.read_bits(8).unwrap();
        assert!(matches!(
            r.read_bit(),
            Err(J2kError::MalformedPacketHeader(_))
        ));
    }

    #[test]
    fn test_reader_eof() {
        let mut r = J2kBitReader::new(&[]);
        assert_eq!(r.read_bit(), Err(J2kError::UnexpectedEnd));
    }
}

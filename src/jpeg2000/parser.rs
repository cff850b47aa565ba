//! Codestream header parsing.
//!
//! Reads the main header (SOC, SIZ, COD, QCD) back into [`CodingParams`] and tile-part
//! headers (SOT, optional PLT, SOD) into [`TilePartHeader`]s. Packet data is left to the
//! tile.

use super::kernel::KernelId;
use super::quantization::QuantStep;
use crate::coding_parameters::{CodingParams, ComponentInfo, ProgressionOrder};
use crate::constants::{
    MAXIMUM_TILE_PART_INDEX, RESUME_TRAILER_BYTES, SOD_MARKER_BYTES, SOT_LENGTH_FIELD,
    SOT_SEGMENT_BYTES,
};
use crate::error::J2kError;
use crate::jpeg_marker_code::MarkerCode;
use crate::stream_reader::CompressedSource;
use log::debug;

/// Main header content.
#[derive(Debug, Clone)]
pub struct MainHeader {
    pub params: CodingParams,
    pub steps: Vec<QuantStep>,
    /// Bytes from SOC up to the first SOT marker.
    pub header_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePartHeader {
    pub tile: u16,
    /// Psot: tile-part length from the SOT marker, or 0 when it runs to the end.
    pub length: u32,
    pub part_index: u8,
    /// TNsot; 0 when unknown.
    pub num_parts: u8,
    /// Bytes from SOT to the end of SOD.
    pub header_bytes: u64,
    /// Codestream address of the first packet byte.
    pub body_start: u64,
    pub packet_lengths: Option<Vec<u64>>,
}

impl TilePartHeader {
    /// Packet data bytes, if the length is known.
    pub fn body_length(&self) -> Option<u64> {
        (self.length != 0).then(|| self.length as u64 - self.header_bytes)
    }
}

/// What a fragmented encode left behind for the next invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumeState {
    pub tiles_completed: u32,
    pub bytes_written: u64,
    pub last_tile_parts: u8,
}

impl ResumeState {
    /// Parses the trailer from the last bytes of a previous output.
    pub fn read(data: &[u8]) -> Result<Self, J2kError> {
        let start = data
            .len()
            .checked_sub(RESUME_TRAILER_BYTES)
            .ok_or(J2kError::UnexpectedEnd)?;
        let t = &data[start..];
        let marker = u16::from_be_bytes([t[0], t[1]]);
        if marker != u16::from(MarkerCode::FragmentEnd) {
            return Err(J2kError::MarkerMismatch {
                expected: MarkerCode::FragmentEnd.into(),
                found: marker,
            });
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&t[6..14]);
        Ok(Self {
            tiles_completed: u32::from_be_bytes([t[2], t[3], t[4], t[5]]),
            bytes_written: u64::from_be_bytes(bytes),
            last_tile_parts: t[14],
        })
    }
}

/// Decodes PLT payload groups, appending to `out`. A length left open at the end of
/// `payload` is carried in `pending`.
pub fn decode_packet_lengths(payload: &[u8], pending: &mut u64, out: &mut Vec<u64>) {
    for &b in payload {
        *pending = (*pending << 7) | (b & 0x7F) as u64;
        if b & 0x80 == 0 {
            out.push(*pending);
            *pending = 0;
        }
    }
}

pub struct J2kParser<'a> {
    pub reader: &'a mut dyn CompressedSource,
}

impl<'a> J2kParser<'a> {
    pub fn new(reader: &'a mut dyn CompressedSource) -> Self {
        Self { reader }
    }

    fn segment_length(&mut self) -> Result<u16, J2kError> {
        let len = self.reader.read_u16()?;
        if len < 2 {
            return Err(J2kError::MalformedMainHeader(format!("segment length {len}")));
        }
        Ok(len)
    }

    /// Parses up to and including the first SOT marker code.
    pub fn parse_main_header(&mut self) -> Result<MainHeader, J2kError> {
        let start = self.reader.position();
        self.reader.expect_marker(MarkerCode::StartOfCodestream)?;
        let mut params = CodingParams::default();
        let mut steps = Vec::new();
        let mut seen_siz = false;
        let mut seen_cod = false;
        loop {
            let code = self.reader.read_u16()?;
            let marker = MarkerCode::try_from(code)
                .map_err(|_| J2kError::MalformedMainHeader(format!("unknown marker {code:#06x}")))?;
            match marker {
                MarkerCode::ImageAndTileSize => {
                    self.parse_siz(&mut params)?;
                    seen_siz = true;
                }
                MarkerCode::CodingStyleDefault => {
                    self.parse_cod(&mut params)?;
                    seen_cod = true;
                }
                MarkerCode::QuantizationDefault => steps = self.parse_qcd(&mut params)?,
                MarkerCode::StartOfTile => break,
                m if m.has_segment() => {
                    let len = self.segment_length()?;
                    debug!("skipping main header segment {m:?}");
                    self.reader.skip(len as u64 - 2)?;
                }
                m => {
                    return Err(J2kError::MalformedMainHeader(format!(
                        "{m:?} inside the main header"
                    )));
                }
            }
        }
        if !seen_siz || !seen_cod {
            return Err(J2kError::MalformedMainHeader("SIZ or COD missing".into()));
        }
        apply_irreversible_base(&mut params, &steps);
        params.validate().map_err(|e| J2kError::MalformedMainHeader(e.to_string()))?;
        Ok(MainHeader {
            params,
            steps,
            header_bytes: self.reader.position() - start - 2,
        })
    }

    pub fn parse_siz(&mut self, params: &mut CodingParams) -> Result<(), J2kError> {
        let len = self.segment_length()?;
        let _rsiz = self.reader.read_u16()?;
        params.image_x1 = self.reader.read_u32()?;
        params.image_y1 = self.reader.read_u32()?;
        params.image_x0 = self.reader.read_u32()?;
        params.image_y0 = self.reader.read_u32()?;
        params.tile_width = self.reader.read_u32()?;
        params.tile_height = self.reader.read_u32()?;
        params.tile_x0 = self.reader.read_u32()?;
        params.tile_y0 = self.reader.read_u32()?;
        let count = self.reader.read_u16()?;
        if len as usize != 38 + 3 * count as usize {
            return Err(J2kError::MalformedMainHeader(format!(
                "Lsiz {len} for {count} components"
            )));
        }
        params.components.clear();
        for _ in 0..count {
            let ssiz = self.reader.read_u8()?;
            params.components.push(ComponentInfo {
                precision: (ssiz & 0x7F) + 1,
                signed: ssiz & 0x80 != 0,
                sub_x: self.reader.read_u8()?,
                sub_y: self.reader.read_u8()?,
            });
        }
        Ok(())
    }

    pub fn parse_cod(&mut self, params: &mut CodingParams) -> Result<(), J2kError> {
        let len = self.segment_length()?;
        if len < 12 {
            return Err(J2kError::MalformedMainHeader(format!("Lcod {len}")));
        }
        let scod = self.reader.read_u8()?;
        let progression = self.reader.read_u8()?;
        params.progression = ProgressionOrder::try_from(progression).map_err(|_| {
            J2kError::MalformedMainHeader(format!("progression order {progression}"))
        })?;
        params.num_layers = self.reader.read_u16()?;
        params.mct = self.reader.read_u8()? != 0;
        let style = &mut params.style;
        style.levels = self.reader.read_u8()?;
        style.block_width_exponent = self.reader.read_u8()? + 2;
        style.block_height_exponent = self.reader.read_u8()? + 2;
        let _block_style = self.reader.read_u8()?;
        style.reversible = self.reader.read_u8()? == 1;
        style.kernel = if style.reversible {
            KernelId::Reversible53
        } else {
            KernelId::Irreversible97
        };
        params.use_sop = scod & 0x02 != 0;
        params.use_eph = scod & 0x04 != 0;
        let mut consumed = 12usize;
        style.precinct_exponents.clear();
        if scod & 0x01 != 0 {
            for _ in 0..style.num_resolutions() {
                let b = self.reader.read_u8()?;
                style.precinct_exponents.push((b & 0x0F, b >> 4));
            }
            consumed += style.num_resolutions();
        }
        let remaining = (len as usize).saturating_sub(consumed);
        self.reader.skip(remaining as u64)
    }

    pub fn parse_qcd(&mut self, params: &mut CodingParams) -> Result<Vec<QuantStep>, J2kError> {
        let len = self.segment_length()?;
        if len < 3 {
            return Err(J2kError::MalformedMainHeader(format!("Lqcd {len}")));
        }
        let sqcd = self.reader.read_u8()?;
        params.style.guard_bits = sqcd >> 5;
        let mut left = len as usize - 3;
        let mut steps = Vec::new();
        match sqcd & 0x1F {
            0 => {
                while left >= 1 {
                    let b = self.reader.read_u8()?;
                    steps.push(QuantStep {
                        exponent: b >> 3,
                        mantissa: 0,
                    });
                    left -= 1;
                }
            }
            1 | 2 => {
                while left >= 2 {
                    steps.push(QuantStep::from_u16(self.reader.read_u16()?));
                    left -= 2;
                }
            }
            other => {
                return Err(J2kError::MalformedMainHeader(format!("quantization style {other}")));
            }
        }
        self.reader.skip(left as u64)?;
        Ok(steps)
    }

    /// Parses one tile-part header. `sot_consumed` says whether the SOT marker code has
    /// already been read. Returns `None` at EOC or at a fragment trailer.
    pub fn parse_tile_part_header(
        &mut self,
        sot_consumed: bool,
        num_tiles: u32,
    ) -> Result<Option<TilePartHeader>, J2kError> {
        let start = if sot_consumed {
            self.reader.position() - 2
        } else {
            let start = self.reader.position();
            let code = match self.reader.read_u16() {
                Ok(code) => code,
                Err(J2kError::UnexpectedEnd) => return Ok(None),
                Err(e) => return Err(e),
            };
            if code == u16::from(MarkerCode::EndOfCodestream)
                || code == u16::from(MarkerCode::FragmentEnd)
            {
                return Ok(None);
            }
            if code != u16::from(MarkerCode::StartOfTile) {
                return Err(J2kError::MarkerMismatch {
                    expected: MarkerCode::StartOfTile.into(),
                    found: code,
                });
            }
            start
        };
        let lsot = self.reader.read_u16()?;
        if lsot != SOT_LENGTH_FIELD {
            return Err(J2kError::MalformedTilePartHeader(format!("Lsot {lsot}")));
        }
        let tile = self.reader.read_u16()?;
        let length = self.reader.read_u32()?;
        let part_index = self.reader.read_u8()?;
        let num_parts = self.reader.read_u8()?;
        if tile as u32 >= num_tiles {
            return Err(J2kError::MalformedTilePartHeader(format!(
                "tile {tile} of {num_tiles}"
            )));
        }
        if length != 0 && (length as u64) < SOT_SEGMENT_BYTES + SOD_MARKER_BYTES {
            return Err(J2kError::MalformedTilePartHeader(format!("Psot {length}")));
        }
        if part_index > MAXIMUM_TILE_PART_INDEX {
            return Err(J2kError::MalformedTilePartHeader(format!(
                "tile-part index {part_index}"
            )));
        }

        let mut lengths: Option<Vec<u64>> = None;
        let mut pending = 0u64;
        loop {
            let code = self.reader.read_u16()?;
            if code == u16::from(MarkerCode::StartOfData) {
                break;
            }
            let marker = MarkerCode::try_from(code).map_err(|_| {
                J2kError::MalformedTilePartHeader(format!("unknown marker {code:#06x}"))
            })?;
            let len = self.reader.read_u16()?;
            if len < 2 || !marker.has_segment() {
                return Err(J2kError::MalformedTilePartHeader(format!(
                    "{marker:?} with length {len}"
                )));
            }
            if marker == MarkerCode::PacketLengthsTilePart {
                if len < 3 {
                    return Err(J2kError::MalformedTilePartHeader(format!("Lplt {len}")));
                }
                let _zplt = self.reader.read_u8()?;
                let mut payload = vec![0u8; len as usize - 3];
                self.reader.read_exact(&mut payload)?;
                decode_packet_lengths(&payload, &mut pending, lengths.get_or_insert_with(Vec::new));
            } else {
                debug!("skipping tile-part segment {marker:?}");
                self.reader.skip(len as u64 - 2)?;
            }
        }
        if pending != 0 {
            return Err(J2kError::MalformedTilePartHeader("unterminated PLT length".into()));
        }
        let body_start = self.reader.position();
        let header = TilePartHeader {
            tile,
            length,
            part_index,
            num_parts,
            header_bytes: body_start - start,
            body_start,
            packet_lengths: lengths,
        };
        if header.length != 0 && header.header_bytes > header.length as u64 {
            return Err(J2kError::MalformedTilePartHeader(format!(
                "Psot {} shorter than its header",
                header.length
            )));
        }
        Ok(Some(header))
    }
}

/// Irreversible step sizes carry the base step only indirectly; take it from the
/// lowest band.
fn apply_irreversible_base(params: &mut CodingParams, steps: &[QuantStep]) {
    if params.style.reversible {
        return;
    }
    let Some(first) = steps.first() else {
        return;
    };
    let precision = params.components.first().map_or(8, |c| c.precision);
    let base = first.delta(precision) / (1u64 << precision.min(62)) as f64;
    if base > 0.0 && base.is_finite() {
        params.style.base_step = base as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jpeg2000::writer::J2kWriter;
    use crate::profile::ProfileMonitor;
    use crate::stream_reader::MemorySource;
    use crate::stream_writer::MemoryTarget;

    fn header_bytes(params: &CodingParams) -> Vec<u8> {
        let mut target = MemoryTarget::new();
        let steps = vec![QuantStep::reversible(9); 3 * params.style.levels as usize + 1];
        let mut w = J2kWriter::new(&mut target);
        w.write_main_header(params, &steps, &ProfileMonitor::new()).unwrap();
        w.write_sot(0, 0, 0, 1).unwrap();
        w.write_sod().unwrap();
        target.into_inner()
    }

    #[test]
    fn test_main_header_roundtrip() {
        let mut params = CodingParams::new(300, 200, 3);
        params.tile_width = 128;
        params.tile_height = 128;
        params.num_layers = 4;
        params.progression = ProgressionOrder::Rpcl;
        params.use_sop = true;
        params.use_eph = true;
        params.style.levels = 3;
        params.style.block_width_exponent = 5;
        params.style.precinct_exponents = vec![(5, 5), (6, 6), (7, 7), (7, 7)];
        params.components[1].sub_x = 2;
        let bytes = header_bytes(&params);
        let mut source = MemorySource::new(bytes);
        let main = J2kParser::new(&mut source).parse_main_header().unwrap();
        let p = &main.params;
        assert_eq!((p.image_x1, p.image_y1, p.tile_width), (300, 200, 128));
        assert_eq!(p.components[1].sub_x, 2);
        assert_eq!(p.num_layers, 4);
        assert_eq!(p.progression, ProgressionOrder::Rpcl);
        assert!(p.use_sop && p.use_eph);
        assert_eq!(p.style.levels, 3);
        assert_eq!(p.style.block_width_exponent, 5);
        assert_eq!(p.style.precinct_exponents, params.style.precinct_exponents);
        assert_eq!(main.steps.len(), 10);
    }

    #[test]
    fn test_tile_part_header() {
        let params = CodingParams::new(64, 64, 1);
        let bytes = header_bytes(&params);
        let mut source = MemorySource::new(bytes);
        let mut parser = J2kParser::new(&mut source);
        let main = parser.parse_main_header().unwrap();
        let tp = parser.parse_tile_part_header(true, 1).unwrap().unwrap();
        assert_eq!(tp.tile, 0);
        assert_eq!(tp.num_parts, 1);
        assert_eq!(tp.header_bytes, 14);
        assert_eq!(tp.body_start, main.header_bytes + 14);
        assert!(tp.packet_lengths.is_none());
        assert_eq!(parser.parse_tile_part_header(false, 1).unwrap(), None);
    }

    #[test]
    fn test_rejects_bad_sot() {
        let mut target = MemoryTarget::new();
        let mut w = J2kWriter::new(&mut target);
        w.write_sot(0, 5, 0, 1).unwrap();
        w.write_sod().unwrap();
        let mut source = MemorySource::new(target.into_inner());
        let err = J2kParser::new(&mut source).parse_tile_part_header(false, 1).unwrap_err();
        assert_eq!(err.code(), 305);

        let mut target = MemoryTarget::new();
        J2kWriter::new(&mut target).write_sot(4, 0, 0, 1).unwrap();
        let mut source = MemorySource::new(target.into_inner());
        assert!(J2kParser::new(&mut source).parse_tile_part_header(false, 2).is_err());
    }

    #[test]
    fn test_plt_lengths_decode() {
        let mut out = Vec::new();
        let mut pending = 0;
        decode_packet_lengths(&[0x05, 0x81], &mut pending, &mut out);
        decode_packet_lengths(&[0x48], &mut pending, &mut out);
        assert_eq!(out, vec![5, 200]);
        assert_eq!(pending, 0);
    }
}

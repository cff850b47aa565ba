use super::parser::ResumeState;
use super::quantization::QuantStep;
use crate::coding_parameters::CodingParams;
use crate::constants::{PLT_MAXIMUM_SEGMENT_BYTES, SOT_LENGTH_FIELD};
use crate::error::J2kError;
use crate::jpeg_marker_code::MarkerCode;
use crate::profile::{ProfileCause, ProfileMonitor};
use crate::stream_writer::CompressedTarget;
use log::debug;

const SCOD_PRECINCTS: u8 = 0x01;
const SCOD_SOP: u8 = 0x02;
const SCOD_EPH: u8 = 0x04;
/// Rsiz bit announcing Part 2 capabilities.
const RSIZ_EXTENSIONS: u16 = 0x8000;
const SQCD_NO_QUANTIZATION: u8 = 0x00;
const SQCD_SCALAR_EXPOUNDED: u8 = 0x02;

/// Bytes PLT segments take for packets of the given lengths, marker and length fields
/// included.
pub fn plt_bytes(lengths: &[u64]) -> u64 {
    encode_packet_lengths(lengths)
        .iter()
        .map(|seg| seg.len() as u64 + 5)
        .sum()
}

/// Packet lengths as PLT payloads (7 bits per byte, continuation in the high bit). A
/// length never straddles two segments.
pub fn encode_packet_lengths(lengths: &[u64]) -> Vec<Vec<u8>> {
    let limit = PLT_MAXIMUM_SEGMENT_BYTES - 1;
    let mut segments = Vec::new();
    let mut current = Vec::new();
    for &len in lengths {
        let mut groups = Vec::with_capacity(3);
        let mut v = len;
        groups.push((v & 0x7F) as u8);
        v >>= 7;
        while v > 0 {
            groups.push(0x80 | (v & 0x7F) as u8);
            v >>= 7;
        }
        groups.reverse();
        if current.len() + groups.len() > limit {
            segments.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(&groups);
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

pub struct J2kWriter<'a> {
    writer: &'a mut dyn CompressedTarget,
}

impl<'a> J2kWriter<'a> {
    pub fn new(destination: &'a mut dyn CompressedTarget) -> Self {
        Self {
            writer: destination,
        }
    }

    pub fn position(&self) -> u64 {
        self.writer.position()
    }

    pub fn write_soc(&mut self) -> Result<(), J2kError> {
        self.writer.write_marker(MarkerCode::StartOfCodestream)
    }

    pub fn write_eoc(&mut self) -> Result<(), J2kError> {
        self.writer.write_marker(MarkerCode::EndOfCodestream)
    }

    /// SOC, SIZ, COD and QCD. `steps` lists the subband step sizes of the first
    /// tile-component, lowest resolution first.
    pub fn write_main_header(
        &mut self,
        params: &CodingParams,
        steps: &[QuantStep],
        profile: &ProfileMonitor,
    ) -> Result<u64, J2kError> {
        let start = self.position();
        if !params.is_mallat() {
            profile.note(ProfileCause::NonMallatDecomposition);
        }
        self.write_soc()?;
        self.write_siz(params)?;
        self.write_cod(params)?;
        self.write_qcd(params, steps)?;
        let bytes = self.position() - start;
        debug!("main header: {bytes} bytes");
        Ok(bytes)
    }

    pub fn write_siz(&mut self, params: &CodingParams) -> Result<(), J2kError> {
        let count = params.components.len();
        self.writer.write_marker(MarkerCode::ImageAndTileSize)?;
        // Rsiz(2) + 8 * 4-byte fields + Csiz(2) + 3 per component, plus the length field.
        self.writer.write_u16((38 + 3 * count) as u16)?;
        let rsiz = if params.is_mallat() { 0 } else { RSIZ_EXTENSIONS };
        self.writer.write_u16(rsiz)?;
        self.writer.write_u32(params.image_x1)?;
        self.writer.write_u32(params.image_y1)?;
        self.writer.write_u32(params.image_x0)?;
        self.writer.write_u32(params.image_y0)?;
        self.writer.write_u32(params.tile_width)?;
        self.writer.write_u32(params.tile_height)?;
        self.writer.write_u32(params.tile_x0)?;
        self.writer.write_u32(params.tile_y0)?;
        self.writer.write_u16(count as u16)?;
        for info in &params.components {
            let ssiz = (info.precision - 1) | if info.signed { 0x80 } else { 0 };
            self.writer.write_u8(ssiz)?;
            self.writer.write_u8(info.sub_x)?;
            self.writer.write_u8(info.sub_y)?;
        }
        Ok(())
    }

    pub fn write_cod(&mut self, params: &CodingParams) -> Result<(), J2kError> {
        let style = &params.style;
        let custom_precincts = !style.precinct_exponents.is_empty();
        let mut scod = 0;
        if custom_precincts {
            scod |= SCOD_PRECINCTS;
        }
        if params.use_sop {
            scod |= SCOD_SOP;
        }
        if params.use_eph {
            scod |= SCOD_EPH;
        }
        let precinct_bytes = if custom_precincts {
            style.num_resolutions()
        } else {
            0
        };
        self.writer.write_marker(MarkerCode::CodingStyleDefault)?;
        // Scod(1) + SGcod(4) + SPcod(5) + precinct sizes, plus the length field.
        self.writer.write_u16((12 + precinct_bytes) as u16)?;
        self.writer.write_u8(scod)?;
        self.writer.write_u8(params.progression.into())?;
        self.writer.write_u16(params.num_layers)?;
        self.writer.write_u8(params.mct as u8)?;
        self.writer.write_u8(style.levels)?;
        self.writer.write_u8(style.block_width_exponent - 2)?;
        self.writer.write_u8(style.block_height_exponent - 2)?;
        self.writer.write_u8(0)?; // code-block style
        self.writer.write_u8(style.reversible as u8)?;
        if custom_precincts {
            for r in 0..style.num_resolutions() {
                let (ppx, ppy) = style.precinct_exponents_for(r);
                self.writer.write_u8((ppy << 4) | ppx)?;
            }
        }
        Ok(())
    }

    pub fn write_qcd(&mut self, params: &CodingParams, steps: &[QuantStep]) -> Result<(), J2kError> {
        let style = &params.style;
        let (sqcd, per_step) = if style.reversible {
            (SQCD_NO_QUANTIZATION, 1)
        } else {
            (SQCD_SCALAR_EXPOUNDED, 2)
        };
        self.writer.write_marker(MarkerCode::QuantizationDefault)?;
        self.writer.write_u16((3 + per_step * steps.len()) as u16)?;
        self.writer.write_u8((style.guard_bits << 5) | sqcd)?;
        for step in steps {
            if style.reversible {
                self.writer.write_u8(step.exponent << 3)?;
            } else {
                self.writer.write_u16(step.to_u16())?;
            }
        }
        Ok(())
    }

    pub fn write_sot(
        &mut self,
        tile_index: u16,
        tile_part_length: u32,
        tile_part_index: u8,
        num_tile_parts: u8,
    ) -> Result<(), J2kError> {
        self.writer.write_marker(MarkerCode::StartOfTile)?;
        self.writer.write_u16(SOT_LENGTH_FIELD)?;
        self.writer.write_u16(tile_index)?;
        self.writer.write_u32(tile_part_length)?;
        self.writer.write_u8(tile_part_index)?;
        self.writer.write_u8(num_tile_parts)?;
        Ok(())
    }

    /// One PLT segment per payload, indexed from `first_index`.
    pub fn write_plt(&mut self, first_index: u8, segments: &[Vec<u8>]) -> Result<(), J2kError> {
        for (i, payload) in segments.iter().enumerate() {
            let index = first_index as usize + i;
            if index > u8::MAX as usize {
                return Err(J2kError::FieldOverflow {
                    field: "Zplt",
                    value: index as u64,
                });
            }
            self.writer.write_marker(MarkerCode::PacketLengthsTilePart)?;
            self.writer.write_u16((payload.len() + 3) as u16)?;
            self.writer.write_u8(index as u8)?;
            self.writer.write(payload)?;
        }
        Ok(())
    }

    pub fn write_sod(&mut self) -> Result<(), J2kError> {
        self.writer.write_marker(MarkerCode::StartOfData)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), J2kError> {
        self.writer.write(data)
    }

    /// Temporary end marker telling a later invocation where to continue.
    pub fn write_resume_trailer(&mut self, state: &ResumeState) -> Result<(), J2kError> {
        self.writer.write_marker(MarkerCode::FragmentEnd)?;
        self.writer.write_u32(state.tiles_completed)?;
        self.writer.write_u64(state.bytes_written)?;
        self.writer.write_u8(state.last_tile_parts)?;
        Ok(())
    }

    pub fn target(&mut self) -> &mut dyn CompressedTarget {
        &mut *self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_writer::MemoryTarget;

    #[test]
    fn test_write_header_sequence() {
        let mut params = CodingParams::new(512, 512, 3);
        params.tile_width = 128;
        params.tile_height = 128;
        params.use_sop = true;
        let mut target = MemoryTarget::new();
        let profile = ProfileMonitor::new();
        let steps = vec![QuantStep::reversible(9); 16];
        let bytes = J2kWriter::new(&mut target)
            .write_main_header(&params, &steps, &profile)
            .unwrap();
        let written = target.as_slice();
        assert_eq!(bytes, written.len() as u64);
        assert_eq!(&written[..4], &[0xFF, 0x4F, 0xFF, 0x51]);
        // SIZ: marker plus Lsiz = 38 + 9.
        assert_eq!(&written[51..53], &[0xFF, 0x52]);
        assert_eq!(written[55] & SCOD_SOP, SCOD_SOP);
        assert!(written.windows(2).any(|w| w == [0xFF, 0x5C]));
        assert!(profile.relaxed_causes().is_empty());
    }

    #[test]
    fn test_sot_layout() {
        let mut target = MemoryTarget::new();
        J2kWriter::new(&mut target).write_sot(3, 0x0102_0304, 1, 2).unwrap();
        assert_eq!(
            target.as_slice(),
            &[0xFF, 0x90, 0x00, 0x0A, 0x00, 0x03, 0x01, 0x02, 0x03, 0x04, 0x01, 0x02]
        );
    }

    #[test]
    fn test_packet_length_groups() {
        let segments = encode_packet_lengths(&[5, 200, 16384]);
        assert_eq!(segments, vec![vec![0x05, 0x81, 0x48, 0x81, 0x80, 0x00]]);
        assert_eq!(plt_bytes(&[5, 200, 16384]), 11);
    }

    #[test]
    fn test_packet_lengths_split_into_segments() {
        let lengths = vec![1000u64; 40000];
        let segments = encode_packet_lengths(&lengths);
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.len() < PLT_MAXIMUM_SEGMENT_BYTES));
        assert_eq!(segments.iter().map(Vec::len).sum::<usize>(), 80000);
    }

    #[test]
    fn test_resume_trailer() {
        let mut target = MemoryTarget::new();
        let state = ResumeState {
            tiles_completed: 2,
            bytes_written: 0x1234,
            last_tile_parts: 1,
        };
        J2kWriter::new(&mut target).write_resume_trailer(&state).unwrap();
        let bytes = target.into_inner();
        assert_eq!(bytes.len(), 15);
        assert_eq!(&bytes[..2], &[0xFF, 0x3F]);
        assert_eq!(ResumeState::read(&bytes).unwrap(), state);
    }
}

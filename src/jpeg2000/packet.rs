//! Packet construction and parsing.
//!
//! A packet carries one layer of one precinct: a bit-packed header (inclusion tag trees,
//! missing most significant bit-planes, pass counts and codeword lengths) followed by the
//! code-block bytes, optionally framed by SOP and EPH markers.

use super::bit_io::{J2kBitReader, J2kBitWriter};
use super::precinct::{Precinct, PrecinctFlags, PrecinctStorage};
use super::tag_tree::TagTree;
use crate::constants::{
    CBR_FILLER_QUANTUM, EPH_MARKER_BYTES, INITIAL_LBLOCK, MAXIMUM_MAGNITUDE_BITS,
    MAXIMUM_PASSES_PER_CONTRIBUTION, SOP_LENGTH_FIELD, SOP_SEGMENT_BYTES,
};
use crate::error::J2kError;
use crate::jpeg_marker_code::MarkerCode;
use crate::stream_writer::CompressedTarget;
use log::trace;

/// Candidate filler sizes tried below the exact shortfall of a constant-rate packet.
const CBR_SEARCH_WINDOW: u32 = 8;
/// Longest codeword length field a decoder accepts.
const MAXIMUM_LENGTH_BITS: u8 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketOptions {
    pub use_sop: bool,
    pub use_eph: bool,
}

impl PacketOptions {
    pub fn marker_bytes(&self) -> u64 {
        (if self.use_sop { SOP_SEGMENT_BYTES } else { 0 })
            + (if self.use_eph { EPH_MARKER_BYTES } else { 0 })
    }
}

#[derive(Debug, Clone)]
pub struct BandTrees {
    pub inclusion: TagTree,
    pub msbs: TagTree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockCodingState {
    pub included: bool,
    pub lblock: u8,
    pub passes: u16,
}

/// Inter-packet coding state of one precinct.
#[derive(Debug, Clone, Default)]
pub struct HeaderState {
    pub bands: Vec<BandTrees>,
    pub blocks: Vec<BlockCodingState>,
    pub initialized: bool,
}

impl HeaderState {
    pub fn new(storage: &PrecinctStorage) -> Self {
        let bands = storage
            .bands
            .iter()
            .map(|b| {
                let (w, h) = b.dims();
                BandTrees {
                    inclusion: TagTree::new(w, h),
                    msbs: TagTree::new(w, h),
                }
            })
            .collect();
        Self {
            bands,
            blocks: vec![
                BlockCodingState {
                    included: false,
                    lblock: INITIAL_LBLOCK,
                    passes: 0,
                };
                storage.blocks.len()
            ],
            initialized: true,
        }
    }

    /// State for output: every missing-MSB value is known once the precinct is ready.
    pub fn for_encoding(storage: &PrecinctStorage) -> Self {
        let mut state = Self::new(storage);
        for (trees, band) in state.bands.iter_mut().zip(&storage.bands) {
            let (w, _) = band.dims();
            for i in 0..band.len() {
                let msbs = storage.blocks[band.first + i]
                    .encoding
                    .as_ref()
                    .map_or(0, |e| e.missing_msbs as i32);
                trees.msbs.set_value(i % w, i / w, msbs);
            }
        }
        state
    }
}

fn write_pass_count(writer: &mut J2kBitWriter, passes: u16) {
    match passes {
        1 => writer.write_bit(0),
        2 => writer.write_bits(0b10, 2),
        3..=5 => {
            writer.write_bits(0b11, 2);
            writer.write_bits((passes - 3) as u32, 2);
        }
        6..=36 => {
            writer.write_bits(0b1111, 4);
            writer.write_bits((passes - 6) as u32, 5);
        }
        _ => {
            writer.write_bits(0x1FF, 9);
            writer.write_bits((passes - 37) as u32, 7);
        }
    }
}

fn read_pass_count(reader: &mut J2kBitReader) -> Result<u16, J2kError> {
    if reader.read_bit()? == 0 {
        return Ok(1);
    }
    if reader.read_bit()? == 0 {
        return Ok(2);
    }
    let v = reader.read_bits(2)? as u16;
    if v != 3 {
        return Ok(3 + v);
    }
    let v = reader.read_bits(5)? as u16;
    if v != 31 {
        return Ok(6 + v);
    }
    Ok(37 + reader.read_bits(7)? as u16)
}

fn floor_log2(v: u16) -> u8 {
    (15 - v.leading_zeros()) as u8
}

/// Encodes a header for `layer` into `state`. `cum` holds the cumulative passes of each
/// block after this layer, `extra` the filler bytes added to each contribution.
/// Returns the header bytes and the body length.
fn encode_header(
    state: &mut HeaderState,
    storage: &PrecinctStorage,
    layer: u16,
    cum: &[u16],
    extra: &[u32],
) -> (Vec<u8>, u64) {
    let mut writer = J2kBitWriter::new();
    let contributes = |i: usize| cum[i] > state.blocks[i].passes;
    if !(0..storage.blocks.len()).any(contributes) {
        writer.write_bit(0);
        return (writer.finish(), 0);
    }
    writer.write_bit(1);

    // First-inclusion values of this layer go in before any leaf is coded.
    for (trees, band) in state.bands.iter_mut().zip(&storage.bands) {
        let (w, _) = band.dims();
        for i in 0..band.len() {
            let slot = band.first + i;
            if !state.blocks[slot].included && cum[slot] > state.blocks[slot].passes {
                trees.inclusion.set_value(i % w, i / w, layer as i32);
            }
        }
    }

    let mut body = 0u64;
    for (trees, band) in state.bands.iter_mut().zip(&storage.bands) {
        let (w, _) = band.dims();
        for i in 0..band.len() {
            let slot = band.first + i;
            let (x, y) = (i % w, i / w);
            let block = &mut state.blocks[slot];
            let new_passes = cum[slot] - block.passes;
            if !block.included {
                trees.inclusion.encode(&mut writer, x, y, layer as i32 + 1);
                if new_passes == 0 {
                    continue;
                }
                let msbs = trees.msbs.value(x, y).unwrap_or(0);
                trees.msbs.encode(&mut writer, x, y, msbs + 1);
                block.included = true;
            } else {
                writer.write_bit((new_passes > 0) as u8);
                if new_passes == 0 {
                    continue;
                }
            }

            let Some(enc) = storage.blocks[slot].encoding.as_ref() else {
                continue;
            };
            let length = enc.length_at(cum[slot]) - enc.length_at(block.passes) + extra[slot];
            write_pass_count(&mut writer, new_passes);
            let base = floor_log2(new_passes);
            let mut bits = block.lblock + base;
            while bits < 32 && (length as u64) >= (1u64 << bits) {
                writer.write_bit(1);
                block.lblock += 1;
                bits += 1;
            }
            writer.write_bit(0);
            writer.write_bits(length, bits);
            block.passes = cum[slot];
            body += length as u64;
        }
    }
    (writer.finish(), body)
}

/// Blocks' cumulative passes at `threshold`, never below what earlier layers sent.
fn select_passes(p: &Precinct, layer: u16, threshold: u16) -> Vec<u16> {
    let storage = &p.storage;
    let mut cum = vec![0u16; storage.blocks.len()];
    for band in &storage.bands {
        for slot in band.first..band.first + band.len() {
            let block = &storage.blocks[slot];
            let floor = block.passes_before(layer);
            cum[slot] = match &block.encoding {
                Some(enc) => enc.passes_for_threshold(threshold, floor, band.max_passes),
                None => floor,
            };
            // One contribution carries at most 164 passes.
            cum[slot] = cum[slot].min(floor + MAXIMUM_PASSES_PER_CONTRIBUTION);
        }
    }
    cum
}

struct Evaluation {
    state: HeaderState,
    total: u64,
}

fn evaluate(p: &Precinct, layer: u16, cum: &[u16], extra: &[u32], opts: &PacketOptions) -> Evaluation {
    let mut state = p.sim_state.clone();
    let (header, body) = encode_header(&mut state, &p.storage, layer, cum, extra);
    Evaluation {
        state,
        total: opts.marker_bytes() + header.len() as u64 + body,
    }
}

fn check_simulation(p: &mut Precinct, layer: u16) -> Result<(), J2kError> {
    let outstanding = p.outstanding();
    if outstanding != 0 {
        return Err(J2kError::PrecinctNotReady { outstanding });
    }
    if layer != p.finalized_layers {
        return Err(J2kError::InvalidOperation("layers are finalized in order"));
    }
    if !p.sim_state.initialized {
        p.sim_state = HeaderState::for_encoding(&p.storage);
        p.out_state = p.sim_state.clone();
    }
    Ok(())
}

fn commit(p: &mut Precinct, cum: &[u16], extra: &[u32], eval: Evaluation) {
    let mut significant = false;
    for (slot, block) in p.storage.blocks.iter_mut().enumerate() {
        let floor = block.passes_before(p.finalized_layers);
        significant |= cum[slot] > 0;
        debug_assert!(cum[slot] >= floor);
        block.layer_passes.push(cum[slot]);
        block.filler.push(extra[slot]);
    }
    p.storage.layer_bytes.push(eval.total);
    p.sim_state = eval.state;
    p.finalized_layers += 1;
    p.flags |= PrecinctFlags::GENERATING;
    if significant {
        p.flags |= PrecinctFlags::SIGNIFICANT;
    }
}

/// Length of the packet for `layer` at slope `threshold`. With `max_bytes`, the
/// lowest-slope contributions are pulled back one truncation point at a time until the
/// packet fits. With `finalize` the selection is committed.
pub fn simulate_packet(
    p: &mut Precinct,
    layer: u16,
    threshold: u16,
    max_bytes: Option<u64>,
    finalize: bool,
    opts: &PacketOptions,
) -> Result<u64, J2kError> {
    check_simulation(p, layer)?;
    let mut cum = select_passes(p, layer, threshold);
    let extra = vec![0u32; cum.len()];
    let mut eval = evaluate(p, layer, &cum, &extra, opts);
    if let Some(limit) = max_bytes {
        while eval.total > limit {
            let mut victim = None;
            let mut lowest = u16::MAX;
            for (slot, block) in p.storage.blocks.iter().enumerate() {
                let floor = block.passes_before(layer);
                let Some(enc) = block.encoding.as_ref() else {
                    continue;
                };
                if cum[slot] <= floor {
                    continue;
                }
                let s = enc.slopes[cum[slot] as usize - 1];
                // Ties go to the block coded last.
                if s <= lowest {
                    lowest = s;
                    victim = Some(slot);
                }
            }
            let Some(slot) = victim else {
                break;
            };
            let block = &p.storage.blocks[slot];
            let floor = block.passes_before(layer);
            if let Some(enc) = block.encoding.as_ref() {
                cum[slot] = enc.previous_truncation_point(cum[slot], floor);
            }
            eval = evaluate(p, layer, &cum, &extra, opts);
        }
    }
    let total = eval.total;
    if finalize {
        commit(p, &cum, &extra, eval);
    }
    Ok(total)
}

/// Like [`simulate_packet`] without trimming, then pads the contributions with zero
/// filler bytes so that the packet comes as close to `target` bytes as possible without
/// exceeding it.
pub fn simulate_packet_cbr(
    p: &mut Precinct,
    layer: u16,
    threshold: u16,
    target: u64,
    finalize: bool,
    opts: &PacketOptions,
) -> Result<u64, J2kError> {
    check_simulation(p, layer)?;
    let cum = select_passes(p, layer, threshold);
    let mut extra = vec![0u32; cum.len()];
    let base = evaluate(p, layer, &cum, &extra, opts);
    let hosts: Vec<usize> = (0..cum.len())
        .filter(|&s| cum[s] > p.storage.blocks[s].passes_before(layer) && p.storage.blocks[s].encoding.is_some())
        .collect();
    if base.total >= target || hosts.is_empty() {
        let total = base.total;
        if finalize {
            commit(p, &cum, &extra, base);
        }
        return Ok(total);
    }

    let needed = target - base.total;
    let bulk = needed / CBR_FILLER_QUANTUM as u64;
    let fine = (needed % CBR_FILLER_QUANTUM as u64) as u32;
    for q in 0..bulk {
        let host = hosts[(q % hosts.len() as u64) as usize];
        extra[host] = extra[host].saturating_add(CBR_FILLER_QUANTUM);
    }
    let fine_host = hosts[0];
    let bulk_extra = extra[fine_host];
    let mut best: Option<(u64, u32)> = None;
    for back in 0..=CBR_SEARCH_WINDOW.min(fine) {
        extra[fine_host] = bulk_extra + fine - back;
        let total = evaluate(p, layer, &cum, &extra, opts).total;
        if total == target {
            best = Some((total, extra[fine_host]));
            break;
        }
        if total < target && best.is_none_or(|(t, _)| total > t) {
            best = Some((total, extra[fine_host]));
        }
    }
    let Some((_, chosen)) = best else {
        // Signalling the bulk filler alone overshoots: fall back to no filler.
        let total = base.total;
        if finalize {
            extra.iter_mut().for_each(|e| *e = 0);
            commit(p, &cum, &extra, base);
        }
        return Ok(total);
    };
    extra[fine_host] = chosen;
    let eval = evaluate(p, layer, &cum, &extra, opts);
    let total = eval.total;
    trace!("constant-rate packet: {total} of {target} bytes");
    if finalize {
        commit(p, &cum, &extra, eval);
    }
    Ok(total)
}

/// Writes the finalized packet for `layer`, failing if its length differs from the
/// simulated one.
pub fn write_packet(
    p: &mut Precinct,
    layer: u16,
    sequence: u16,
    target: &mut dyn CompressedTarget,
    opts: &PacketOptions,
) -> Result<u64, J2kError> {
    if layer >= p.finalized_layers || layer != p.next_layer {
        return Err(J2kError::InvalidOperation("packet written out of order"));
    }
    let cum: Vec<u16> = p
        .storage
        .blocks
        .iter()
        .map(|b| b.layer_passes[layer as usize])
        .collect();
    let extra: Vec<u32> = p
        .storage
        .blocks
        .iter()
        .map(|b| b.filler[layer as usize])
        .collect();
    let prev: Vec<u16> = p.out_state.blocks.iter().map(|b| b.passes).collect();
    let (header, body) = encode_header(&mut p.out_state, &p.storage, layer, &cum, &extra);
    let total = opts.marker_bytes() + header.len() as u64 + body;
    let simulated = p.storage.layer_bytes[layer as usize];
    if total != simulated {
        return Err(J2kError::SimulationMismatch {
            simulated,
            written: total,
        });
    }

    if opts.use_sop {
        target.write_marker(MarkerCode::StartOfPacket)?;
        target.write_u16(SOP_LENGTH_FIELD)?;
        target.write_u16(sequence)?;
    }
    target.write(&header)?;
    if opts.use_eph {
        target.write_marker(MarkerCode::EndOfPacketHeader)?;
    }
    for (slot, block) in p.storage.blocks.iter().enumerate() {
        if cum[slot] == prev[slot] {
            continue;
        }
        if let Some(enc) = &block.encoding {
            let from = enc.length_at(prev[slot]) as usize;
            let to = enc.length_at(cum[slot]) as usize;
            target.write(&enc.bytes[from..to])?;
        }
        if extra[slot] > 0 {
            target.write(&vec![0u8; extra[slot] as usize])?;
        }
    }
    p.next_layer += 1;
    Ok(total)
}

/// Writes a layer finalized by [`simulate_packet_cbr`]. The filler bytes are part of
/// the committed selection, so this is [`write_packet`] under another name.
pub fn write_packet_cbr(
    p: &mut Precinct,
    layer: u16,
    sequence: u16,
    target: &mut dyn CompressedTarget,
    opts: &PacketOptions,
) -> Result<u64, J2kError> {
    write_packet(p, layer, sequence, target, opts)
}

/// Steps a packet moves through while it is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    AwaitingMarker,
    SopConfirmed,
    HeaderParsed,
    EphConfirmed,
    BodyRead,
    Accepted,
}

struct Contribution {
    slot: usize,
    passes: u16,
    length: u32,
}

fn decode_header(
    state: &mut HeaderState,
    storage: &PrecinctStorage,
    layer: u16,
    data: &[u8],
) -> Result<(usize, Vec<Contribution>), J2kError> {
    let mut reader = J2kBitReader::new(data);
    let mut out = Vec::new();
    if reader.read_bit()? == 0 {
        reader.align();
        return Ok((reader.position(), out));
    }
    for (trees, band) in state.bands.iter_mut().zip(&storage.bands) {
        let (w, _) = band.dims();
        for i in 0..band.len() {
            let slot = band.first + i;
            let (x, y) = (i % w, i / w);
            let block = &mut state.blocks[slot];
            if !block.included {
                if !trees.inclusion.decode(&mut reader, x, y, layer as i32 + 1)? {
                    continue;
                }
                let limit = 2 * MAXIMUM_MAGNITUDE_BITS as i32 + 1;
                trees.msbs.decode(&mut reader, x, y, limit)?;
                if trees.msbs.value(x, y).is_none() {
                    return Err(J2kError::MalformedPacketHeader(
                        "missing bit-plane count out of range".into(),
                    ));
                }
                block.included = true;
            } else if reader.read_bit()? == 0 {
                continue;
            }
            let passes = read_pass_count(&mut reader)?;
            while reader.read_bit()? == 1 {
                block.lblock += 1;
                if block.lblock > MAXIMUM_LENGTH_BITS {
                    return Err(J2kError::MalformedPacketHeader("Lblock overflow".into()));
                }
            }
            let bits = block.lblock + floor_log2(passes);
            if bits > MAXIMUM_LENGTH_BITS {
                return Err(J2kError::MalformedPacketHeader("codeword length field too wide".into()));
            }
            let length = reader.read_bits(bits)?;
            block.passes = block.passes.saturating_add(passes);
            out.push(Contribution {
                slot,
                passes,
                length,
            });
        }
    }
    reader.align();
    Ok((reader.position(), out))
}

/// Parses the packet for `layer` from the start of `data` and returns its length.
/// Block bytes are kept only when `keep` is set.
pub fn parse_packet(
    p: &mut Precinct,
    layer: u16,
    data: &[u8],
    sequence: u16,
    opts: &PacketOptions,
    keep: bool,
) -> Result<u64, J2kError> {
    if !p.out_state.initialized {
        p.out_state = HeaderState::new(&p.storage);
    }
    let mut pos = 0usize;
    let mut contributions = Vec::new();
    let mut state = ParseState::AwaitingMarker;
    loop {
        trace!("packet layer {layer}: {state:?} at {pos}");
        state = match state {
            ParseState::AwaitingMarker => {
                if opts.use_sop {
                    let seg = data
                        .get(..SOP_SEGMENT_BYTES as usize)
                        .ok_or(J2kError::UnexpectedEnd)?;
                    let marker = u16::from_be_bytes([seg[0], seg[1]]);
                    if marker != MarkerCode::StartOfPacket as u16 {
                        return Err(J2kError::MarkerMismatch {
                            expected: MarkerCode::StartOfPacket as u16,
                            found: marker,
                        });
                    }
                    let found = u16::from_be_bytes([seg[4], seg[5]]);
                    if u16::from_be_bytes([seg[2], seg[3]]) != SOP_LENGTH_FIELD || found != sequence {
                        return Err(J2kError::SopSequenceMismatch {
                            expected: sequence,
                            found,
                        });
                    }
                    pos += SOP_SEGMENT_BYTES as usize;
                }
                ParseState::SopConfirmed
            }
            ParseState::SopConfirmed => {
                let (len, found) = decode_header(&mut p.out_state, &p.storage, layer, &data[pos..])?;
                pos += len;
                contributions = found;
                ParseState::HeaderParsed
            }
            ParseState::HeaderParsed => {
                if opts.use_eph {
                    let seg = data.get(pos..pos + 2).ok_or(J2kError::UnexpectedEnd)?;
                    if u16::from_be_bytes([seg[0], seg[1]]) != MarkerCode::EndOfPacketHeader as u16 {
                        return Err(J2kError::MissingEph);
                    }
                    pos += 2;
                }
                ParseState::EphConfirmed
            }
            ParseState::EphConfirmed => {
                let body: u64 = contributions.iter().map(|c| c.length as u64).sum();
                if (pos as u64 + body) > data.len() as u64 {
                    return Err(J2kError::UnexpectedEnd);
                }
                for c in &contributions {
                    let bytes = &data[pos..pos + c.length as usize];
                    pos += c.length as usize;
                    let block = &mut p.storage.blocks[c.slot];
                    if block.received.layers == 0 && block.received.passes == 0 {
                        let band = p
                            .storage
                            .bands
                            .iter()
                            .zip(&p.out_state.bands)
                            .find(|(b, _)| (b.first..b.first + b.len()).contains(&c.slot));
                        if let Some((b, trees)) = band {
                            let (w, _) = b.dims();
                            let i = c.slot - b.first;
                            block.received.missing_msbs =
                                trees.msbs.value(i % w, i / w).unwrap_or(0) as u8;
                        }
                    }
                    block.received.passes += c.passes;
                    block.received.layers += 1;
                    if keep {
                        block.received.bytes.extend_from_slice(bytes);
                    }
                }
                ParseState::BodyRead
            }
            ParseState::BodyRead => {
                if !contributions.is_empty() {
                    p.flags |= PrecinctFlags::SIGNIFICANT;
                }
                p.storage.layer_bytes.push(pos as u64);
                p.finalized_layers += 1;
                ParseState::Accepted
            }
            ParseState::Accepted => return Ok(pos as u64),
        };
    }
}

//! Tiles: block storage, tile-part generation and packet desequencing.
//!
//! A tile owns its tile-components and an arena of the precincts currently materialized.
//! Every precinct position holds a [`PrecinctRef`]; precincts are created on first use
//! and turned back into closed references once their packets have been written, or once
//! the application has closed them and the inactive budget forces eviction.

use super::code_block::{BlockEncoding, CodeBlock, ReceivedBlock};
use super::geometry::{Coords, Rect};
use super::notifier::ResolutionNotifier;
use super::packet::{HeaderState, PacketOptions, parse_packet, write_packet};
use super::parser::TilePartHeader;
use super::precinct::{
    Precinct, PrecinctArena, PrecinctBand, PrecinctFlags, PrecinctId, PrecinctRef,
    PrecinctRefState,
};
use super::precinct_server::{AllocContext, InactiveEntry, PrecinctServer, SizeClassKey};
use super::progression::{
    PacketRef, PacketSequencer, SequenceScope, SequencerLayout, SequencerResolution,
};
use super::subband::Subband;
use super::tile_component::TileComponent;
use super::writer::{J2kWriter, encode_packet_lengths};
use crate::coding_parameters::{CodingParams, ProgressionOrder, TilePartDivision};
use crate::constants::{
    MAXIMUM_SOP_GAP, MAXIMUM_TILE_PARTS, MAXIMUM_TILE_PART_INDEX, SOD_MARKER_BYTES,
    SOP_LENGTH_FIELD, SOT_SEGMENT_BYTES,
};
use crate::error::J2kError;
use crate::jpeg_marker_code::MarkerCode;
use crate::profile::{ProfileCause, ProfileMonitor};
use crate::stream_reader::CompressedSource;
use crate::stream_writer::CompressedTarget;
use log::{debug, trace, warn};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

/// What the application wants from an input codestream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputRestrictions {
    /// Canvas region of interest; `None` keeps the whole image.
    pub region: Option<Rect>,
    /// Highest resolutions to leave out.
    pub discard_levels: u8,
    pub max_layers: Option<u16>,
    pub components: Option<Range<usize>>,
}

/// Result of desequencing one packet (or a run of packets) from a tile-part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    Parsed { bytes: u64 },
    /// Damaged data was skipped; `skipped` packets were lost before the next valid SOP.
    Recovered { skipped: u32 },
    /// Packets stepped over without parsing.
    Skipped { packets: u32, bytes: u64 },
    /// The rest of the tile-part could not be attributed to packets.
    Abandoned { bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TilePartReport {
    pub tile: u32,
    pub part_index: u8,
    pub packets: u32,
    /// SOT through the last packet byte; 0 when no tile-part was produced.
    pub bytes: u64,
    pub interrupted: bool,
    pub final_part: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TilePartRead {
    pub parsed: u32,
    pub skipped: u32,
    pub recoveries: u32,
    pub abandoned_bytes: u64,
}

/// Where a tile-part sits in the codestream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePartRecord {
    pub address: u64,
    pub body_start: u64,
    pub end: u64,
}

struct PartInput<'b> {
    body: &'b [u8],
    body_start: u64,
    lengths: Option<&'b [u64]>,
    seekable: bool,
}

pub struct Tile {
    pub index: u32,
    pub coords: Coords,
    /// Canvas region.
    pub rect: Rect,
    pub components: Vec<TileComponent>,
    pub num_layers: u16,
    pub progression: ProgressionOrder,
    /// Shares every coding parameter with the codestream defaults.
    pub typical: bool,
    /// Built by repositioning a released tile rather than from scratch.
    pub recycled: bool,
    params: Arc<CodingParams>,
    server: Arc<PrecinctServer>,
    profile: Arc<ProfileMonitor>,
    opts: PacketOptions,
    arena: PrecinctArena,
    sequencer: PacketSequencer,
    restrictions: InputRestrictions,
    packet_seq: u16,
    next_tpart: u8,
    num_tparts: Option<u8>,
    interruptions_used: u32,
    sequenced_packets: u64,
    max_packets: u64,
    sequenced_relevant_packets: u64,
    max_relevant_packets: u64,
    total_blocks: u64,
    stored_blocks: u64,
    tile_parts: Vec<TilePartRecord>,
    closed: bool,
    exhausted: bool,
    released: bool,
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("index", &self.index)
            .field("rect", &self.rect)
            .field("precincts", &self.arena.len())
            .field("sequenced_packets", &self.sequenced_packets)
            .field("max_packets", &self.max_packets)
            .finish()
    }
}

fn crosses_boundary(division: TilePartDivision, first: &PacketRef, next: &PacketRef) -> bool {
    (division.contains(TilePartDivision::RESOLUTION) && next.resolution != first.resolution)
        || (division.contains(TilePartDivision::COMPONENT) && next.component != first.component)
        || (division.contains(TilePartDivision::LAYER) && next.layer != first.layer)
}

/// First SOP at or after `from` whose sequence number is between `min_gap` and
/// `max_gap` packets ahead of `expected`. Returns its offset and the gap.
fn find_sop(body: &[u8], from: usize, expected: u16, min_gap: u16, max_gap: u64) -> Option<(usize, u16)> {
    let sop = MarkerCode::StartOfPacket.to_bytes();
    let len = SOP_LENGTH_FIELD.to_be_bytes();
    let last = body.len().checked_sub(6)?;
    (from..=last).find_map(|q| {
        let w = &body[q..q + 6];
        if w[..2] != sop || w[2..4] != len {
            return None;
        }
        let gap = u16::from_be_bytes([w[4], w[5]]).wrapping_sub(expected);
        (gap >= min_gap && gap as u64 <= max_gap).then_some((q, gap))
    })
}

impl Tile {
    pub fn new(
        index: u32,
        params: Arc<CodingParams>,
        server: Arc<PrecinctServer>,
        profile: Arc<ProfileMonitor>,
    ) -> Result<Self, J2kError> {
        let rect = params.tile_rect(index)?;
        let mut components = Vec::with_capacity(params.components.len());
        for (c, info) in params.components.iter().enumerate() {
            components.push(TileComponent::new(
                c,
                &rect,
                info,
                params.component_style(index, c),
                params.partition_origin,
                params.mct,
                &profile,
            )?);
        }
        let progression = params.progression_for(index);
        let opts = PacketOptions {
            use_sop: params.use_sop,
            use_eph: params.use_eph,
        };
        let num_layers = params.num_layers;
        let typical = params.is_typical(index);
        let coords = params.tile_coords(index);
        let placeholder = SequencerLayout {
            tile: rect,
            num_layers,
            relevant_layers: num_layers,
            components: Vec::new(),
            relevant_resolutions: Vec::new(),
            relevant_components: Vec::new(),
        };
        let mut tile = Self {
            index,
            coords,
            rect,
            components,
            num_layers,
            progression,
            typical,
            recycled: false,
            params,
            server,
            profile,
            opts,
            arena: PrecinctArena::default(),
            sequencer: PacketSequencer::new(progression, SequenceScope::All, placeholder),
            restrictions: InputRestrictions::default(),
            packet_seq: 0,
            next_tpart: 0,
            num_tparts: None,
            interruptions_used: 0,
            sequenced_packets: 0,
            max_packets: 0,
            sequenced_relevant_packets: 0,
            max_relevant_packets: 0,
            total_blocks: 0,
            stored_blocks: 0,
            tile_parts: Vec::new(),
            closed: false,
            exhausted: false,
            released: false,
        };
        tile.reset_sequencing();
        debug!(
            "tile {index}: created {}x{} at ({}, {})",
            rect.width(),
            rect.height(),
            rect.x0,
            rect.y0
        );
        Ok(tile)
    }

    /// Reuses this tile's structure for tile `index`, which must share its coding
    /// parameters and shape class.
    pub fn recycle(mut self, index: u32) -> Result<Self, J2kError> {
        self.release();
        let rect = self.params.tile_rect(index)?;
        for tc in &mut self.components {
            tc.reposition(&rect)?;
        }
        self.index = index;
        self.coords = self.params.tile_coords(index);
        self.rect = rect;
        self.recycled = true;
        self.restrictions = InputRestrictions::default();
        self.next_tpart = 0;
        self.num_tparts = None;
        self.interruptions_used = 0;
        self.stored_blocks = 0;
        self.tile_parts.clear();
        self.closed = false;
        self.exhausted = false;
        self.released = false;
        self.reset_sequencing();
        debug!("tile {index}: recycled");
        Ok(self)
    }

    fn layout(&self) -> SequencerLayout {
        let r = &self.restrictions;
        let components = self
            .components
            .iter()
            .map(|tc| {
                let sub = Coords::new(tc.info.sub_x as i64, tc.info.sub_y as i64);
                tc.resolutions
                    .iter()
                    .map(|res| SequencerResolution::from_resolution(res, sub))
                    .collect()
            })
            .collect();
        SequencerLayout {
            tile: self.rect,
            num_layers: self.num_layers,
            relevant_layers: r.max_layers.map_or(self.num_layers, |m| m.min(self.num_layers)),
            components,
            relevant_resolutions: self
                .components
                .iter()
                .map(|tc| self.relevant_resolutions(tc.index))
                .collect(),
            relevant_components: (0..self.components.len())
                .map(|c| self.component_relevant(c))
                .collect(),
        }
    }

    fn component_relevant(&self, c: usize) -> bool {
        self.restrictions
            .components
            .as_ref()
            .is_none_or(|range| range.contains(&c))
    }

    fn relevant_resolutions(&self, c: usize) -> usize {
        if !self.component_relevant(c) {
            return 0;
        }
        let n = self.components[c].num_resolutions();
        n.saturating_sub(self.restrictions.discard_levels as usize).max(1)
    }

    fn reset_sequencing(&mut self) {
        let layout = self.layout();
        self.sequencer = PacketSequencer::new(self.progression, SequenceScope::All, layout.clone());
        self.max_packets = self.sequencer.remaining();
        self.max_relevant_packets =
            PacketSequencer::new(self.progression, SequenceScope::Relevant, layout).remaining();
        self.sequenced_packets = 0;
        self.sequenced_relevant_packets = 0;
        self.packet_seq = 0;
        self.total_blocks = self
            .components
            .iter()
            .flat_map(|tc| tc.resolutions.iter())
            .flat_map(|r| r.subbands.iter())
            .map(|b| b.block_indices.area() as u64)
            .sum();
    }

    /// Packets inside the current restrictions, in codestream order.
    pub fn relevant_packets(&self) -> PacketSequencer {
        PacketSequencer::new(self.progression, SequenceScope::Relevant, self.layout())
    }

    pub fn is_relevant(&self, pk: &PacketRef) -> bool {
        let layers = self
            .restrictions
            .max_layers
            .map_or(self.num_layers, |m| m.min(self.num_layers));
        pk.layer < layers
            && pk.resolution < self.relevant_resolutions(pk.component)
            && self.components[pk.component].resolutions[pk.resolution].is_relevant(pk.precinct)
    }

    pub fn apply_restrictions(&mut self, restrictions: &InputRestrictions) {
        self.restrictions = restrictions.clone();
        for tc in &mut self.components {
            let sub = Coords::new(tc.info.sub_x as i64, tc.info.sub_y as i64);
            for res in &mut tc.resolutions {
                let region = match restrictions.region {
                    None => res.rect,
                    Some(region) => region
                        .subsample(sub)
                        .subsample(Coords::new(1i64 << res.hor_depth, 1i64 << res.vert_depth)),
                };
                res.restrict(&region);
            }
        }
        let layout = self.layout();
        self.max_relevant_packets =
            PacketSequencer::new(self.progression, SequenceScope::Relevant, layout).remaining();
        // Recount what has already gone by under the new restrictions.
        let mut lookahead = self.sequencer.clone();
        lookahead.restart();
        let mut passed = 0;
        for _ in 0..self.sequenced_packets {
            match lookahead.next_packet() {
                Some(pk) if self.is_relevant(&pk) => passed += 1,
                Some(_) => {}
                None => break,
            }
        }
        self.sequenced_relevant_packets = passed;
        for id in self.arena.ids() {
            let Some(p) = self.arena.get(id) else {
                continue;
            };
            let (c, r, pos) = (p.component, p.resolution, p.position);
            let relevant = self.component_relevant(c)
                && r < self.relevant_resolutions(c)
                && self.components[c].resolutions[r].is_relevant(pos);
            if let Some(p) = self.arena.get_mut(id) {
                p.flags.set(PrecinctFlags::RELEVANT, relevant);
            }
        }
        debug!(
            "tile {}: {} of {} packets relevant",
            self.index, self.max_relevant_packets, self.max_packets
        );
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    pub fn component(&self, c: usize) -> Result<&TileComponent, J2kError> {
        self.components.get(c).ok_or(J2kError::ComponentOutOfRange {
            requested: c,
            available: self.components.len(),
        })
    }

    pub fn subband(&self, c: usize, r: usize, band: usize) -> Result<&Subband, J2kError> {
        let res = self.component(c)?.resolution(r)?;
        res.subbands.get(band).ok_or(J2kError::PositionOutOfRange {
            what: "subband",
            x: band as i64,
            y: 0,
        })
    }

    pub fn notifier(&self, c: usize, r: usize) -> Result<Arc<ResolutionNotifier>, J2kError> {
        Ok(Arc::clone(&self.component(c)?.resolution(r)?.notifier))
    }

    pub fn packet_options(&self) -> PacketOptions {
        self.opts
    }

    pub fn writes_plt(&self) -> bool {
        self.params.write_plt
    }

    pub fn params(&self) -> &CodingParams {
        &self.params
    }

    pub fn sequenced_packets(&self) -> u64 {
        self.sequenced_packets
    }

    pub fn max_packets(&self) -> u64 {
        self.max_packets
    }

    pub fn sequenced_relevant_packets(&self) -> u64 {
        self.sequenced_relevant_packets
    }

    pub fn max_relevant_packets(&self) -> u64 {
        self.max_relevant_packets
    }

    /// Tile-parts produced or parsed so far.
    pub fn tile_parts(&self) -> u8 {
        self.next_tpart
    }

    pub fn tile_part_records(&self) -> &[TilePartRecord] {
        &self.tile_parts
    }

    /// TNsot of the tile, once a tile-part header announced it.
    pub fn announced_tile_parts(&self) -> Option<u8> {
        self.num_tparts
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// All relevant packets have been sequenced.
    pub fn is_complete(&self) -> bool {
        self.exhausted || self.sequenced_relevant_packets >= self.max_relevant_packets
    }

    /// Fraction of the tile's code-blocks stored so far.
    pub fn ready_fraction(&self) -> f64 {
        if self.total_blocks == 0 {
            return 1.0;
        }
        self.stored_blocks as f64 / self.total_blocks as f64
    }

    /// Tile-parts the forced boundaries alone will produce.
    pub fn estimated_tile_parts(&self) -> u64 {
        let division = self.params.tile_part_division;
        let mut n = 1u64;
        if division.contains(TilePartDivision::RESOLUTION) {
            n *= self.components.iter().map(|c| c.num_resolutions()).max().unwrap_or(1) as u64;
        }
        if division.contains(TilePartDivision::COMPONENT) {
            n *= self.components.len() as u64;
        }
        if division.contains(TilePartDivision::LAYER) {
            n *= self.num_layers as u64;
        }
        n.min(MAXIMUM_TILE_PARTS as u64)
    }

    pub fn precincts(&self) -> impl Iterator<Item = &Precinct> {
        self.arena.iter()
    }

    pub fn precincts_mut(&mut self) -> impl Iterator<Item = &mut Precinct> {
        self.arena.iter_mut()
    }

    pub fn num_live_precincts(&self) -> usize {
        self.arena.len()
    }

    pub fn precinct_ref(&self, c: usize, r: usize, p: Coords) -> Result<PrecinctRef, J2kError> {
        let res = self.component(c)?.resolution(r)?;
        let slot = res.precinct_slot(p).ok_or(J2kError::PositionOutOfRange {
            what: "precinct",
            x: p.x,
            y: p.y,
        })?;
        Ok(res.precinct_refs[slot])
    }

    pub fn precinct(&self, c: usize, r: usize, p: Coords) -> Result<Option<&Precinct>, J2kError> {
        Ok(self
            .precinct_ref(c, r, p)?
            .active_id()
            .and_then(|id| self.arena.get(id)))
    }

    fn set_ref(&mut self, c: usize, r: usize, p: Coords, value: PrecinctRef) {
        let res = &mut self.components[c].resolutions[r];
        if let Some(slot) = res.precinct_slot(p) {
            res.precinct_refs[slot] = value;
        }
    }

    /// Returns the live precinct at `p`, creating it when the position is unallocated.
    fn materialize(
        &mut self,
        c: usize,
        r: usize,
        p: Coords,
        ctx: AllocContext,
        input: bool,
    ) -> Result<PrecinctId, J2kError> {
        let res = self.component(c)?.resolution(r)?;
        let slot = res.precinct_slot(p).ok_or(J2kError::PositionOutOfRange {
            what: "precinct",
            x: p.x,
            y: p.y,
        })?;
        match res.precinct_refs[slot].state() {
            PrecinctRefState::Active(id) => return Ok(id),
            PrecinctRefState::Closed { .. } => return Err(J2kError::PrecinctUnavailable),
            PrecinctRefState::Unallocated => {}
        }

        let key = SizeClassKey {
            max_blocks: res.max_blocks_per_precinct,
            num_bands: res.subbands.len() as u16,
            num_layers: self.num_layers,
        };
        let mut storage = self.server.allocate(ctx, key);
        let mut total = 0usize;
        for band in &res.subbands {
            let blocks = band.blocks_in_precinct(p);
            if blocks.is_empty() {
                continue;
            }
            storage.bands.push(PrecinctBand {
                band: band.index,
                blocks,
                first: total,
                max_passes: band.max_passes,
            });
            for i in 0..blocks.area() as usize {
                let idx = blocks.position_of(i);
                let mut block = CodeBlock::default();
                block.reset(idx, band.block_rect(idx));
                storage.blocks.push(block);
            }
            total += blocks.area() as usize;
        }
        let mut flags = PrecinctFlags::LOADED;
        if total == 0 {
            flags |= PrecinctFlags::NO_CONTRIBUTION;
        }
        if self.component_relevant(c) && r < self.relevant_resolutions(c) && res.is_relevant(p) {
            flags |= PrecinctFlags::RELEVANT;
        }
        let outstanding = if input { 0 } else { total as u32 };
        let precinct = Precinct {
            storage,
            component: c,
            resolution: r,
            position: p,
            unique_id: self.server.next_unique_id(),
            address: None,
            flags,
            outstanding_blocks: AtomicU32::new(outstanding),
            finalized_layers: 0,
            next_layer: 0,
            sim_state: HeaderState::default(),
            out_state: HeaderState::default(),
        };
        let id = self.arena.insert(precinct)?;
        self.components[c].resolutions[r].precinct_refs[slot] = PrecinctRef::active(id);
        trace!("tile {}: precinct {c}/{r} {p:?} materialized with {total} blocks", self.index);
        Ok(id)
    }

    /// Creates every precinct that holds no code-blocks, so that rate control sees
    /// their (empty) packets.
    pub fn prepare_output(&mut self) -> Result<(), J2kError> {
        let mut empty = Vec::new();
        for (c, tc) in self.components.iter().enumerate() {
            for (r, res) in tc.resolutions.iter().enumerate() {
                for i in 0..res.num_precincts() {
                    let p = res.precinct_indices.position_of(i);
                    if res.precinct_refs[i].is_unallocated() && res.blocks_in_precinct(p) == 0 {
                        empty.push((c, r, p));
                    }
                }
            }
        }
        for (c, r, p) in empty {
            self.materialize(c, r, p, AllocContext::Precinct, false)?;
        }
        Ok(())
    }

    /// Hands the coded data of one code-block to its precinct.
    pub fn store_block(
        &mut self,
        c: usize,
        r: usize,
        band: usize,
        block: Coords,
        encoding: BlockEncoding,
    ) -> Result<(), J2kError> {
        if self.closed {
            return Err(J2kError::TileClosed { tile: self.index });
        }
        encoding.validate()?;
        let res = self.component(c)?.resolution(r)?;
        let p = res
            .precinct_of_block(band, block)
            .ok_or(J2kError::PositionOutOfRange {
                what: "code-block",
                x: block.x,
                y: block.y,
            })?;
        let row = res
            .subbands
            .get(band)
            .map(|b| (block.y - b.block_indices.y0) as u32)
            .ok_or(J2kError::PositionOutOfRange {
                what: "subband",
                x: band as i64,
                y: 0,
            })?;
        let notifier = Arc::clone(&res.notifier);
        let id = self.materialize(c, r, p, AllocContext::Precinct, false)?;
        let precinct = self.arena.get_mut(id).ok_or(J2kError::PrecinctUnavailable)?;
        let slot = precinct
            .storage
            .block_slot(band, block)
            .ok_or(J2kError::PositionOutOfRange {
                what: "code-block",
                x: block.x,
                y: block.y,
            })?;
        if precinct.storage.blocks[slot].encoding.is_some() {
            return Err(J2kError::BlockAlreadyStored {
                x: block.x,
                y: block.y,
            });
        }
        let remaining = precinct.block_stored()?;
        precinct.storage.blocks[slot].encoding = Some(encoding);
        self.stored_blocks += 1;
        notifier.block_done(band, row);
        if remaining == 0 {
            trace!("tile {}: precinct {c}/{r} {p:?} ready", self.index);
        }
        Ok(())
    }

    fn output_ready(&self, pk: &PacketRef) -> Result<Option<PrecinctId>, J2kError> {
        match self.precinct_ref(pk.component, pk.resolution, pk.precinct)?.state() {
            PrecinctRefState::Unallocated => Ok(None),
            PrecinctRefState::Active(id) => {
                let p = self.arena.get(id).ok_or(J2kError::PrecinctUnavailable)?;
                Ok((p.is_ready() && p.finalized_layers > pk.layer).then_some(id))
            }
            PrecinctRefState::Closed { .. } => {
                Err(J2kError::InvalidOperation("packet of a released precinct"))
            }
        }
    }

    fn empty_report(&self) -> TilePartReport {
        TilePartReport {
            tile: self.index,
            part_index: self.next_tpart,
            ..TilePartReport::default()
        }
    }

    /// Writes the next tile-part: as many ready packets as the forced boundaries allow.
    /// A precinct that is not ready closes the tile-part early while the interruption
    /// budget lasts; otherwise the tile-part is abandoned and a zero-length report
    /// returned, leaving the tile untouched for a later call.
    pub fn generate_tile_part(
        &mut self,
        target: &mut dyn CompressedTarget,
    ) -> Result<TilePartReport, J2kError> {
        if self.exhausted || self.released {
            return Ok(self.empty_report());
        }
        let part = self.next_tpart;
        if part as usize >= MAXIMUM_TILE_PARTS {
            return Err(J2kError::TooManyTileParts { tile: self.index });
        }
        let forced = part < MAXIMUM_TILE_PART_INDEX;
        let division = self.params.tile_part_division;
        let mut lookahead = self.sequencer.clone();
        let mut chosen: Vec<(PacketRef, PrecinctId)> = Vec::new();
        let mut interrupted = false;
        while let Some(pk) = lookahead.peek() {
            if forced {
                if let Some((first, _)) = chosen.first() {
                    if crosses_boundary(division, first, &pk) {
                        break;
                    }
                }
            }
            match self.output_ready(&pk)? {
                Some(id) => {
                    chosen.push((pk, id));
                    lookahead.next_packet();
                }
                None if chosen.is_empty() => return Ok(self.empty_report()),
                None => {
                    if forced && self.interruptions_used < self.params.max_interruptions {
                        self.interruptions_used += 1;
                        self.profile.note(ProfileCause::TilePartInterruption);
                        interrupted = true;
                        break;
                    }
                    debug!(
                        "tile {}: tile-part {part} abandoned, precinct {:?} not ready",
                        self.index, pk.precinct
                    );
                    return Ok(self.empty_report());
                }
            }
        }
        if chosen.is_empty() {
            return Ok(self.empty_report());
        }

        let final_part = lookahead.is_exhausted();
        let lengths: Vec<u64> = chosen
            .iter()
            .map(|(pk, id)| {
                self.arena
                    .get(*id)
                    .and_then(|p| p.storage.layer_bytes.get(pk.layer as usize).copied())
                    .unwrap_or(0)
            })
            .collect();
        let segments = if self.params.write_plt {
            encode_packet_lengths(&lengths)
        } else {
            Vec::new()
        };
        let plt: u64 = segments.iter().map(|s| s.len() as u64 + 5).sum();
        let body: u64 = lengths.iter().sum();
        let psot = SOT_SEGMENT_BYTES + plt + SOD_MARKER_BYTES + body;
        let psot_field = u32::try_from(psot).map_err(|_| J2kError::TilePartTooLong { length: psot })?;
        let tnsot = if final_part { part + 1 } else { 0 };

        let address = target.position();
        {
            let mut w = J2kWriter::new(&mut *target);
            w.write_sot(self.index as u16, psot_field, part, tnsot)?;
            w.write_plt(0, &segments)?;
            w.write_sod()?;
        }
        let body_start = target.position();
        for (pk, id) in &chosen {
            let p = self.arena.get_mut(*id).ok_or(J2kError::PrecinctUnavailable)?;
            let written = write_packet(p, pk.layer, self.packet_seq, target, &self.opts)?;
            trace!(
                "tile {}: packet {} l{} r{} c{} {:?}: {written} bytes",
                self.index, self.packet_seq, pk.layer, pk.resolution, pk.component, pk.precinct
            );
            self.packet_seq = self.packet_seq.wrapping_add(1);
            if p.next_layer >= self.num_layers {
                self.release_written(pk, *id);
            }
        }
        self.sequencer = lookahead;
        self.next_tpart += 1;
        self.sequenced_packets += chosen.len() as u64;
        self.sequenced_relevant_packets += chosen.len() as u64;
        self.exhausted = final_part;
        self.tile_parts.push(TilePartRecord {
            address,
            body_start,
            end: target.position(),
        });
        debug!(
            "tile {}: tile-part {part} with {} packets, {psot} bytes{}",
            self.index,
            chosen.len(),
            if interrupted { " (interrupted)" } else { "" }
        );
        Ok(TilePartReport {
            tile: self.index,
            part_index: part,
            packets: chosen.len() as u32,
            bytes: psot,
            interrupted,
            final_part,
        })
    }

    fn release_written(&mut self, pk: &PacketRef, id: PrecinctId) {
        if let Some(p) = self.arena.remove(id) {
            let has_data = p.flags.contains(PrecinctFlags::SIGNIFICANT);
            self.set_ref(pk.component, pk.resolution, pk.precinct, PrecinctRef::closed(None, false, has_data));
            self.server.release(AllocContext::Precinct, p.storage);
        }
    }

    fn advance_packet(&mut self) -> Option<PacketRef> {
        let pk = self.sequencer.next_packet()?;
        self.packet_seq = self.packet_seq.wrapping_add(1);
        self.sequenced_packets += 1;
        if self.is_relevant(&pk) {
            self.sequenced_relevant_packets += 1;
        }
        Some(pk)
    }

    fn mark_corrupted(&mut self, pk: &PacketRef) {
        match self.materialize(pk.component, pk.resolution, pk.precinct, AllocContext::General, true) {
            Ok(id) => {
                if let Some(p) = self.arena.get_mut(id) {
                    p.flags |= PrecinctFlags::CORRUPTED;
                }
            }
            Err(e) => trace!("tile {}: corrupted packet of unavailable precinct: {e}", self.index),
        }
    }

    /// Desequences the packets of one tile-part body. `seekable` says whether precinct
    /// addresses may be recorded for later reloads.
    pub fn read_tile_part(
        &mut self,
        header: &TilePartHeader,
        body: &[u8],
        seekable: bool,
    ) -> Result<TilePartRead, J2kError> {
        if self.released {
            return Err(J2kError::TileClosed { tile: self.index });
        }
        if header.part_index != self.next_tpart {
            if !self.params.resilient {
                return Err(J2kError::MalformedTilePartHeader(format!(
                    "tile {} part {} arrived, expected part {}",
                    self.index, header.part_index, self.next_tpart
                )));
            }
            warn!("tile {}: tile-part {} out of order", self.index, header.part_index);
        }
        if header.num_parts != 0 {
            self.num_tparts = Some(header.num_parts);
        }
        self.next_tpart = self.next_tpart.saturating_add(1);
        self.tile_parts.push(TilePartRecord {
            address: header.body_start - header.header_bytes,
            body_start: header.body_start,
            end: header.body_start + body.len() as u64,
        });
        let input = PartInput {
            body,
            body_start: header.body_start,
            lengths: header.packet_lengths.as_deref(),
            seekable,
        };
        let mut report = TilePartRead::default();
        let mut pos = 0usize;
        let mut idx = 0usize;
        while pos < body.len() {
            if self.sequencer.peek().is_none() {
                warn!(
                    "tile {}: {} bytes after the last packet",
                    self.index,
                    body.len() - pos
                );
                break;
            }
            let (outcome, next) = self.desequence_packet(&input, pos, idx)?;
            match outcome {
                PacketOutcome::Parsed { .. } => {
                    report.parsed += 1;
                    idx += 1;
                }
                PacketOutcome::Skipped { packets, .. } => {
                    report.skipped += packets;
                    idx += packets as usize;
                }
                PacketOutcome::Recovered { skipped } => {
                    report.recoveries += 1;
                    report.skipped += skipped;
                    idx += skipped as usize;
                }
                PacketOutcome::Abandoned { bytes } => {
                    report.abandoned_bytes += bytes;
                }
            }
            pos = next;
        }
        if self.sequencer.peek().is_none() {
            self.exhausted = true;
        }
        debug!(
            "tile {}: tile-part {} read, {} packets parsed, {} skipped",
            self.index, header.part_index, report.parsed, report.skipped
        );
        Ok(report)
    }

    fn desequence_packet(
        &mut self,
        input: &PartInput,
        pos: usize,
        idx: usize,
    ) -> Result<(PacketOutcome, usize), J2kError> {
        let Some(pk) = self.sequencer.peek() else {
            return Ok((PacketOutcome::Abandoned { bytes: 0 }, input.body.len()));
        };
        let relevant = self.is_relevant(&pk);
        let state = self
            .precinct_ref(pk.component, pk.resolution, pk.precinct)?
            .state();

        if !relevant && pk.layer == 0 && self.progression.layer_innermost() {
            if let (PrecinctRefState::Unallocated, Some(lengths)) = (state, input.lengths) {
                let n = self.num_layers as usize;
                if let Some(run) = lengths.get(idx..idx + n) {
                    let total: u64 = run.iter().sum();
                    if pos as u64 + total <= input.body.len() as u64 {
                        let address = input.body_start + pos as u64;
                        self.set_ref(
                            pk.component,
                            pk.resolution,
                            pk.precinct,
                            PrecinctRef::closed(Some(address), false, true),
                        );
                        for _ in 0..n {
                            self.advance_packet();
                        }
                        return Ok((
                            PacketOutcome::Skipped {
                                packets: n as u32,
                                bytes: total,
                            },
                            pos + total as usize,
                        ));
                    }
                }
            }
        }

        if let PrecinctRefState::Closed { .. } = state {
            return Ok(self.skip_packet(input, pos, idx));
        }
        let id = self.materialize(pk.component, pk.resolution, pk.precinct, AllocContext::General, true)?;
        let corrupted = self
            .arena
            .get(id)
            .is_some_and(|p| p.flags.contains(PrecinctFlags::CORRUPTED));
        if corrupted {
            return Ok(self.skip_packet(input, pos, idx));
        }

        let num_layers = self.num_layers;
        let seq = self.packet_seq;
        let opts = self.opts;
        let p = self.arena.get_mut(id).ok_or(J2kError::PrecinctUnavailable)?;
        if pk.layer == 0 && input.seekable && self.progression.layer_innermost() {
            p.address = Some(input.body_start + pos as u64);
            p.flags |= PrecinctFlags::ADDRESSABLE;
        }
        match parse_packet(p, pk.layer, &input.body[pos..], seq, &opts, relevant) {
            Ok(n) => {
                if p.finalized_layers >= num_layers {
                    p.flags |= PrecinctFlags::READ;
                }
                trace!("tile {}: packet {seq} parsed, {n} bytes", self.index);
                self.advance_packet();
                Ok((PacketOutcome::Parsed { bytes: n }, pos + n as usize))
            }
            Err(e) if e.is_corruption() && self.params.resilient => {
                p.flags |= PrecinctFlags::CORRUPTED;
                warn!("tile {}: packet {seq}: {e}", self.index);
                Ok(self.resynchronize(input, pos))
            }
            Err(e) => Err(e),
        }
    }

    /// Looks for the next SOP that is plausibly ahead of the expected sequence number and
    /// drops the packets in between.
    fn resynchronize(&mut self, input: &PartInput, pos: usize) -> (PacketOutcome, usize) {
        let rest = (input.body.len() - pos) as u64;
        if !self.opts.use_sop {
            return (PacketOutcome::Abandoned { bytes: rest }, input.body.len());
        }
        // The damaged packet itself is still pending. Its own marker is never a
        // resynchronisation point, so the scan starts one byte past it.
        let ahead = self.sequencer.remaining().saturating_sub(1);
        let limit = (MAXIMUM_SOP_GAP as u64).min(ahead);
        match find_sop(input.body, pos + 1, self.packet_seq, 1, limit) {
            Some((q, gap)) => {
                for _ in 0..gap {
                    if let Some(pk) = self.advance_packet() {
                        self.mark_corrupted(&pk);
                    }
                }
                debug!(
                    "tile {}: resynchronised after {gap} packets at offset {q}",
                    self.index
                );
                (PacketOutcome::Recovered { skipped: gap as u32 }, q)
            }
            None => {
                warn!(
                    "tile {}: no SOP to resynchronise on, {rest} bytes dropped",
                    self.index
                );
                (PacketOutcome::Abandoned { bytes: rest }, input.body.len())
            }
        }
    }

    /// Steps over a packet that cannot be parsed, using its PLT length or the next SOP.
    fn skip_packet(&mut self, input: &PartInput, pos: usize, idx: usize) -> (PacketOutcome, usize) {
        let rest = input.body.len() - pos;
        let known = input
            .lengths
            .and_then(|l| l.get(idx))
            .copied()
            .filter(|&len| len as usize <= rest);
        let end = match known {
            Some(len) => Some(pos + len as usize),
            None if self.opts.use_sop => {
                match find_sop(input.body, pos + 1, self.packet_seq, 1, 1) {
                    Some((q, _)) => Some(q),
                    None if self.sequencer.remaining() == 1 => Some(input.body.len()),
                    None => None,
                }
            }
            None => None,
        };
        match end {
            Some(end) => {
                self.advance_packet();
                (
                    PacketOutcome::Skipped {
                        packets: 1,
                        bytes: (end - pos) as u64,
                    },
                    end,
                )
            }
            None => (PacketOutcome::Abandoned { bytes: rest as u64 }, input.body.len()),
        }
    }

    /// Gives access to a precinct, reloading a closed one from its recorded address.
    pub fn open_precinct(
        &mut self,
        c: usize,
        r: usize,
        p: Coords,
        source: Option<&mut dyn CompressedSource>,
    ) -> Result<PrecinctId, J2kError> {
        match self.precinct_ref(c, r, p)?.state() {
            PrecinctRefState::Active(id) => {
                if let Some(precinct) = self.arena.get_mut(id) {
                    precinct.flags.remove(PrecinctFlags::INACTIVE);
                }
                Ok(id)
            }
            PrecinctRefState::Unallocated => self.materialize(c, r, p, AllocContext::General, true),
            PrecinctRefState::Closed { address: None, .. } => Err(J2kError::PrecinctUnavailable),
            PrecinctRefState::Closed {
                address: Some(address),
                was_read,
                has_data,
            } => {
                let source = source
                    .filter(|s| s.supports_seek())
                    .ok_or(J2kError::PrecinctUnavailable)?;
                let closed = PrecinctRef::closed(Some(address), was_read, has_data);
                self.set_ref(c, r, p, PrecinctRef::UNALLOCATED);
                match self.reload(c, r, p, address, source) {
                    Ok(id) => Ok(id),
                    Err(e) => {
                        if let Ok(Some(id)) = self.precinct_ref(c, r, p).map(PrecinctRef::active_id) {
                            if let Some(dead) = self.arena.remove(id) {
                                self.server.release(AllocContext::General, dead.storage);
                            }
                        }
                        self.set_ref(c, r, p, closed);
                        Err(J2kError::CorruptAddressedPrecinct(e.to_string()))
                    }
                }
            }
        }
    }

    fn reload(
        &mut self,
        c: usize,
        r: usize,
        p: Coords,
        address: u64,
        source: &mut dyn CompressedSource,
    ) -> Result<PrecinctId, J2kError> {
        let end = self
            .tile_parts
            .iter()
            .find(|t| t.body_start <= address && address < t.end)
            .map(|t| t.end)
            .ok_or(J2kError::PrecinctUnavailable)?;
        let id = self.materialize(c, r, p, AllocContext::General, true)?;
        source.seek(address)?;
        let data = source.read_up_to((end - address) as usize)?;
        let mut seq = if self.opts.use_sop && data.len() >= 6 {
            u16::from_be_bytes([data[4], data[5]])
        } else {
            0
        };
        let opts = self.opts;
        let num_layers = self.num_layers;
        let precinct = self.arena.get_mut(id).ok_or(J2kError::PrecinctUnavailable)?;
        let mut pos = 0usize;
        for layer in 0..num_layers {
            pos += parse_packet(precinct, layer, &data[pos..], seq, &opts, true)? as usize;
            seq = seq.wrapping_add(1);
        }
        precinct.address = Some(address);
        precinct.flags |= PrecinctFlags::ADDRESSABLE | PrecinctFlags::READ;
        debug!("tile {}: precinct {c}/{r} {p:?} reloaded from {address}", self.index);
        Ok(id)
    }

    /// Marks a precinct as no longer needed by the application. It stays in memory
    /// until the inactive budget is exceeded. Closing twice is a no-op.
    pub fn close_precinct(&mut self, c: usize, r: usize, p: Coords) -> Result<(), J2kError> {
        let Some(id) = self.precinct_ref(c, r, p)?.active_id() else {
            return Ok(());
        };
        let Some(precinct) = self.arena.get_mut(id) else {
            return Ok(());
        };
        if precinct.flags.contains(PrecinctFlags::INACTIVE) {
            return Ok(());
        }
        precinct.flags |= PrecinctFlags::INACTIVE;
        let bytes = precinct.footprint();
        self.server.push_inactive(InactiveEntry {
            tile: self.index,
            component: c,
            resolution: r,
            position: p,
            id,
            bytes,
        });
        Ok(())
    }

    /// Releases an inactive precinct's storage. Entries whose precinct was reopened or
    /// already released are ignored.
    pub fn evict_precinct(&mut self, entry: &InactiveEntry) -> bool {
        let current = self
            .precinct_ref(entry.component, entry.resolution, entry.position)
            .ok()
            .and_then(PrecinctRef::active_id);
        if current != Some(entry.id) {
            return false;
        }
        let inactive = self
            .arena
            .get(entry.id)
            .is_some_and(|p| p.flags.contains(PrecinctFlags::INACTIVE));
        if !inactive {
            return false;
        }
        let Some(p) = self.arena.remove(entry.id) else {
            return false;
        };
        let closed = PrecinctRef::closed(
            p.address,
            p.flags.contains(PrecinctFlags::READ),
            p.flags.contains(PrecinctFlags::SIGNIFICANT),
        );
        self.set_ref(entry.component, entry.resolution, entry.position, closed);
        self.server.release(AllocContext::General, p.storage);
        true
    }

    /// Data received so far for one code-block.
    pub fn retrieve_block(
        &self,
        c: usize,
        r: usize,
        band: usize,
        block: Coords,
    ) -> Result<ReceivedBlock, J2kError> {
        let res = self.component(c)?.resolution(r)?;
        let p = res
            .precinct_of_block(band, block)
            .ok_or(J2kError::PositionOutOfRange {
                what: "code-block",
                x: block.x,
                y: block.y,
            })?;
        match self.precinct_ref(c, r, p)?.state() {
            PrecinctRefState::Unallocated => Ok(ReceivedBlock::default()),
            PrecinctRefState::Closed { .. } => Err(J2kError::PrecinctUnavailable),
            PrecinctRefState::Active(id) => {
                let precinct = self.arena.get(id).ok_or(J2kError::PrecinctUnavailable)?;
                let slot = precinct
                    .storage
                    .block_slot(band, block)
                    .ok_or(J2kError::PositionOutOfRange {
                        what: "code-block",
                        x: block.x,
                        y: block.y,
                    })?;
                Ok(precinct.storage.blocks[slot].received.clone())
            }
        }
    }

    /// Closing twice is a no-op.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!("tile {}: closed", self.index);
        }
    }

    /// Reopens a closed tile that has not been released.
    pub fn restart(&mut self) -> Result<(), J2kError> {
        if self.released {
            return Err(J2kError::TileClosed { tile: self.index });
        }
        self.closed = false;
        debug!("tile {}: restarted", self.index);
        Ok(())
    }

    /// Returns all precinct storage to the server. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        for p in self.arena.drain() {
            self.server.release(AllocContext::General, p.storage);
        }
        self.server.drop_inactive_tile(self.index);
        for tc in &mut self.components {
            for res in &mut tc.resolutions {
                res.precinct_refs.fill(PrecinctRef::UNALLOCATED);
            }
        }
        self.released = true;
        debug!("tile {}: released", self.index);
    }
}

impl Drop for Tile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jpeg2000::packet::simulate_packet;
    use crate::stream_writer::MemoryTarget;

    fn params() -> CodingParams {
        let mut p = CodingParams::new(32, 32, 1);
        p.style.levels = 1;
        p.style.block_width_exponent = 4;
        p.style.block_height_exponent = 4;
        p.use_sop = true;
        p
    }

    fn tile(p: CodingParams) -> Tile {
        Tile::new(
            0,
            Arc::new(p),
            Arc::new(PrecinctServer::new()),
            Arc::new(ProfileMonitor::new()),
        )
        .unwrap()
    }

    fn encoding(seed: u8) -> BlockEncoding {
        let bytes: Vec<u8> = (0..12u8).map(|i| (i * 5 + seed) & 0x7F).collect();
        BlockEncoding::new(bytes, vec![4, 8, 12], vec![50000, 40000, 30000], 2).unwrap()
    }

    fn store_all(t: &mut Tile) {
        for r in 0..t.components[0].num_resolutions() {
            let bands = t.components[0].resolutions[r].subbands.clone();
            for b in &bands {
                for i in 0..b.block_indices.area() as usize {
                    let idx = b.block_indices.position_of(i);
                    t.store_block(0, r, b.index, idx, encoding(i as u8)).unwrap();
                }
            }
        }
    }

    fn finalize_all(t: &mut Tile) {
        let layers = t.num_layers;
        let opts = t.packet_options();
        for p in t.precincts_mut() {
            for l in 0..layers {
                simulate_packet(p, l, 0, None, true, &opts).unwrap();
            }
        }
    }

    #[test]
    fn test_store_block_materializes_precinct() {
        let mut t = tile(params());
        assert_eq!(t.num_live_precincts(), 0);
        t.store_block(0, 1, 0, Coords::new(0, 0), encoding(1)).unwrap();
        assert_eq!(t.num_live_precincts(), 1);
        let p = t.precinct(0, 1, Coords::new(0, 0)).unwrap().unwrap();
        // One precinct spans the three 16x16 bands, one block each.
        assert_eq!(p.outstanding(), 2);
        assert_eq!(
            t.store_block(0, 1, 0, Coords::new(0, 0), encoding(1)),
            Err(J2kError::BlockAlreadyStored { x: 0, y: 0 })
        );
        assert!(t.store_block(0, 1, 5, Coords::new(0, 0), encoding(1)).is_err());
        assert_eq!(
            t.store_block(0, 1, 1, Coords::new(0, 7), encoding(1)),
            Err(J2kError::PositionOutOfRange {
                what: "code-block",
                x: 0,
                y: 7
            })
        );
        assert_eq!(t.precinct(0, 1, Coords::new(0, 0)).unwrap().unwrap().outstanding(), 2);
    }

    #[test]
    fn test_store_block_into_input_precinct_is_rejected() {
        let mut t = tile(params());
        let id = t.open_precinct(0, 1, Coords::new(0, 0), None).unwrap();
        assert_eq!(t.arena.get(id).unwrap().outstanding(), 0);
        assert!(matches!(
            t.store_block(0, 1, 0, Coords::new(0, 0), encoding(1)),
            Err(J2kError::InvalidOperation(_))
        ));
        let p = t.arena.get(id).unwrap();
        assert_eq!(p.outstanding(), 0);
        assert!(p.storage.blocks.iter().all(|b| b.encoding.is_none()));
        assert_eq!(t.stored_blocks, 0);
    }

    #[test]
    fn test_zero_budget_abandons_until_ready() {
        let mut t = tile(params());
        let mut out = MemoryTarget::new();
        t.store_block(0, 0, 0, Coords::new(0, 0), encoding(3)).unwrap();
        finalize_all(&mut t);
        // Resolution 0 is ready but resolution 1 is not: nothing may be emitted.
        let report = t.generate_tile_part(&mut out).unwrap();
        assert_eq!(report.bytes, 0);
        assert_eq!(out.as_slice().len(), 0);
        assert_eq!(t.sequenced_packets(), 0);

        for b in 0..3 {
            t.store_block(0, 1, b, Coords::new(0, 0), encoding(b as u8)).unwrap();
        }
        let opts = t.packet_options();
        for p in t.precincts_mut() {
            if p.finalized_layers == 0 {
                simulate_packet(p, 0, 0, None, true, &opts).unwrap();
            }
        }
        let report = t.generate_tile_part(&mut out).unwrap();
        assert_eq!(report.packets, 2);
        assert!(report.final_part);
        assert_eq!(report.bytes, out.as_slice().len() as u64);
        assert_eq!(t.num_live_precincts(), 0);
    }

    #[test]
    fn test_interruption_budget() {
        let mut p = params();
        p.max_interruptions = 1;
        let mut t = tile(p);
        let mut out = MemoryTarget::new();
        t.store_block(0, 0, 0, Coords::new(0, 0), encoding(3)).unwrap();
        finalize_all(&mut t);
        let report = t.generate_tile_part(&mut out).unwrap();
        assert!(report.interrupted);
        assert_eq!(report.packets, 1);
        assert!(!report.final_part);
        assert_eq!(&out.as_slice()[10..12], &[0, 0]);
        assert!(t.profile.is_relaxed(ProfileCause::TilePartInterruption));
    }

    #[test]
    fn test_forced_resolution_boundaries() {
        let mut p = params();
        p.tile_part_division = TilePartDivision::RESOLUTION;
        let mut t = tile(p);
        store_all(&mut t);
        finalize_all(&mut t);
        let mut out = MemoryTarget::new();
        let first = t.generate_tile_part(&mut out).unwrap();
        let second = t.generate_tile_part(&mut out).unwrap();
        assert_eq!((first.packets, second.packets), (1, 1));
        assert_eq!((first.part_index, second.part_index), (0, 1));
        assert!(second.final_part);
        assert_eq!(t.generate_tile_part(&mut out).unwrap().bytes, 0);
    }

    #[test]
    fn test_restrictions_and_idempotent_close() {
        let mut t = tile(params());
        assert_eq!(t.max_relevant_packets(), 2);
        t.apply_restrictions(&InputRestrictions {
            discard_levels: 1,
            ..InputRestrictions::default()
        });
        assert_eq!(t.max_relevant_packets(), 1);
        t.apply_restrictions(&InputRestrictions {
            region: Some(Rect::new(0, 0, 0, 0)),
            ..InputRestrictions::default()
        });
        assert_eq!(t.max_relevant_packets(), 0);
        assert_eq!(t.relevant_packets().count(), 0);

        t.close();
        t.close();
        assert!(t.is_closed());
        t.release();
        t.release();
        assert!(t.restart().is_err());
    }

    #[test]
    fn test_close_and_evict_precinct() {
        let mut t = tile(params());
        let id = t.open_precinct(0, 1, Coords::new(0, 0), None).unwrap();
        t.close_precinct(0, 1, Coords::new(0, 0)).unwrap();
        t.close_precinct(0, 1, Coords::new(0, 0)).unwrap();
        let server = Arc::clone(&t.server);
        let entry = server.pop_inactive_over_budget(0).unwrap();
        assert!(server.pop_inactive_over_budget(0).is_none());
        assert_eq!(entry.id, id);
        assert!(t.evict_precinct(&entry));
        assert!(!t.evict_precinct(&entry));
        assert_eq!(
            t.open_precinct(0, 1, Coords::new(0, 0), None),
            Err(J2kError::PrecinctUnavailable)
        );
    }
}

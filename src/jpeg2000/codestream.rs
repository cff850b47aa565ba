//! Top-level codestream driver.
//!
//! A [`Codestream`] holds the state that outlives individual tiles: coding parameters,
//! the precinct server, the profile monitor, rate control and the tiles currently open.
//! Byte sources and targets are passed into each call rather than owned, so the same
//! driver works over memory buffers, files and counting sinks.

use super::geometry::Coords;
use super::parser::{J2kParser, MainHeader, ResumeState, TilePartHeader};
use super::precinct::PrecinctId;
use super::precinct_server::PrecinctServer;
use super::quantization::QuantStep;
use super::rate_control::{FlushPlan, RateController};
use super::tile::{InputRestrictions, Tile, TilePartRead, TilePartReport};
use super::tile_component::TileComponent;
use super::code_block::{BlockEncoding, ReceivedBlock};
use super::writer::J2kWriter;
use crate::coding_parameters::CodingParams;
use crate::constants::{SOD_MARKER_BYTES, SOT_SEGMENT_BYTES};
use crate::error::J2kError;
use crate::jpeg_marker_code::MarkerCode;
use crate::profile::{ProfileCause, ProfileMonitor};
use crate::stream_reader::CompressedSource;
use crate::stream_writer::CompressedTarget;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const READ_CHUNK: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Output,
    Input,
}

/// Everything one flush wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub plan: FlushPlan,
    pub tile_parts: Vec<TilePartReport>,
    pub bytes: u64,
    pub released: Vec<u32>,
}

/// One tile-part read from an input codestream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePartSummary {
    pub header: TilePartHeader,
    pub read: TilePartRead,
}

pub struct Codestream {
    direction: Direction,
    params: Arc<CodingParams>,
    server: Arc<PrecinctServer>,
    profile: Arc<ProfileMonitor>,
    steps: Vec<QuantStep>,
    tiles: BTreeMap<u32, Tile>,
    /// Released typical tiles kept for reuse.
    recycle_pool: Vec<Tile>,
    /// Tiles whose resources are gone for good.
    released: BTreeSet<u32>,
    rate: RateController,
    header_bytes: u64,
    header_written: bool,
    /// Tiles finished by earlier invocations of a fragmented encode.
    resumed_tiles: u32,
    /// Tile-part headers the opened tiles are expected to need.
    tile_part_estimate: u64,
    last_tile_parts: u8,
    sot_pending: bool,
    input_done: bool,
    restrictions: InputRestrictions,
}

impl std::fmt::Debug for Codestream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codestream")
            .field("direction", &self.direction)
            .field("open_tiles", &self.tiles.len())
            .field("released", &self.released.len())
            .finish()
    }
}

/// Step sizes of the first tile-component, in QCD order.
fn header_steps(params: &CodingParams, profile: &ProfileMonitor) -> Result<Vec<QuantStep>, J2kError> {
    let info = params
        .components
        .first()
        .ok_or(J2kError::MissingParameter("components"))?;
    let tc = TileComponent::new(
        0,
        &params.tile_rect(0)?,
        info,
        params.component_style(0, 0),
        params.partition_origin,
        params.mct,
        profile,
    )?;
    Ok(tc
        .resolutions
        .iter()
        .flat_map(|r| r.subbands.iter().map(|b| b.step))
        .collect())
}

impl Codestream {
    fn build(direction: Direction, params: CodingParams) -> Result<Self, J2kError> {
        params.validate()?;
        let profile = Arc::new(ProfileMonitor::new());
        let steps = header_steps(&params, &profile)?;
        let rate = RateController::new(params.num_layers, &params.rate);
        Ok(Self {
            direction,
            params: Arc::new(params),
            server: Arc::new(PrecinctServer::new()),
            profile,
            steps,
            tiles: BTreeMap::new(),
            recycle_pool: Vec::new(),
            released: BTreeSet::new(),
            rate,
            header_bytes: 0,
            header_written: false,
            resumed_tiles: 0,
            tile_part_estimate: 0,
            last_tile_parts: 0,
            sot_pending: false,
            input_done: false,
            restrictions: InputRestrictions::default(),
        })
    }

    pub fn create_output(params: CodingParams) -> Result<Self, J2kError> {
        let cs = Self::build(Direction::Output, params)?;
        debug!(
            "output codestream: {} tiles, {} layers, {}",
            cs.params.num_tiles(),
            cs.params.num_layers,
            cs.params.progression.name()
        );
        Ok(cs)
    }

    /// Continues a fragmented encode. The target must be positioned where the trailer
    /// of the previous fragment began; tiles before `state.tiles_completed` are done.
    pub fn resume(params: CodingParams, state: ResumeState) -> Result<Self, J2kError> {
        let mut cs = Self::build(Direction::Output, params)?;
        if state.tiles_completed > cs.params.num_tiles() {
            return Err(J2kError::InvalidParameter {
                name: "resume",
                reason: format!(
                    "{} tiles completed of {}",
                    state.tiles_completed,
                    cs.params.num_tiles()
                ),
            });
        }
        cs.header_written = true;
        cs.header_bytes = state.bytes_written;
        cs.resumed_tiles = state.tiles_completed;
        cs.last_tile_parts = state.last_tile_parts;
        cs.released.extend(0..state.tiles_completed);
        debug!(
            "resuming after {} tiles, {} bytes",
            state.tiles_completed, state.bytes_written
        );
        Ok(cs)
    }

    /// Parses the main header. The codestream's own COD and QCD describe the coding.
    pub fn open_input(source: &mut dyn CompressedSource) -> Result<Self, J2kError> {
        let header = J2kParser::new(source).parse_main_header()?;
        Self::from_header(header, None)
    }

    /// Parses the main header but codes with `params`, for codestreams whose
    /// decomposition cannot be expressed in a Part 1 COD. The canvas and tile
    /// geometry must agree with the header.
    pub fn open_input_with_params(
        source: &mut dyn CompressedSource,
        params: CodingParams,
    ) -> Result<Self, J2kError> {
        let header = J2kParser::new(source).parse_main_header()?;
        let h = &header.params;
        let same = h.image_rect() == params.image_rect()
            && h.tile_grid() == params.tile_grid()
            && h.tile_rect(0)? == params.tile_rect(0)?
            && h.components.len() == params.components.len();
        if !same {
            return Err(J2kError::InvalidParameter {
                name: "params",
                reason: "geometry differs from the main header".into(),
            });
        }
        Self::from_header(header, Some(params))
    }

    fn from_header(header: MainHeader, params: Option<CodingParams>) -> Result<Self, J2kError> {
        let mut cs = Self::build(Direction::Input, params.unwrap_or(header.params))?;
        if !header.steps.is_empty() {
            cs.steps = header.steps;
        }
        cs.header_bytes = header.header_bytes;
        cs.header_written = true;
        cs.sot_pending = true;
        debug!(
            "input codestream: {} tiles, {} header bytes",
            cs.params.num_tiles(),
            cs.header_bytes
        );
        Ok(cs)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn params(&self) -> &CodingParams {
        &self.params
    }

    pub fn profile(&self) -> &ProfileMonitor {
        &self.profile
    }

    pub fn server(&self) -> &Arc<PrecinctServer> {
        &self.server
    }

    /// Step sizes of the first tile-component as written to (or read from) QCD.
    pub fn quantization_steps(&self) -> &[QuantStep] {
        &self.steps
    }

    pub fn header_bytes(&self) -> u64 {
        self.header_bytes
    }

    pub fn rate_controller(&self) -> &RateController {
        &self.rate
    }

    pub fn set_max_bytes(&mut self, layer_targets: &[u64]) -> Result<(), J2kError> {
        self.rate.set_max_bytes(layer_targets)
    }

    pub fn set_min_slope_threshold(&mut self, threshold: u16) {
        self.rate.set_min_slope_threshold(threshold);
    }

    fn check_direction(&self, wanted: Direction) -> Result<(), J2kError> {
        if self.direction != wanted {
            return Err(J2kError::InvalidOperation(match wanted {
                Direction::Output => "codestream is open for input",
                Direction::Input => "codestream is open for output",
            }));
        }
        Ok(())
    }

    fn new_tile(&mut self, index: u32) -> Result<Tile, J2kError> {
        if self.params.is_typical(index) {
            if let Some(spare) = self.recycle_pool.pop() {
                return spare.recycle(index);
            }
        }
        Tile::new(
            index,
            Arc::clone(&self.params),
            Arc::clone(&self.server),
            Arc::clone(&self.profile),
        )
    }

    /// Creates tile `index` on first use.
    pub fn open_tile(&mut self, index: u32) -> Result<&mut Tile, J2kError> {
        if index >= self.params.num_tiles() {
            return Err(J2kError::NoSuchTile { tile: index });
        }
        if self.released.contains(&index) {
            return Err(J2kError::TileClosed { tile: index });
        }
        if !self.tiles.contains_key(&index) {
            let mut tile = self.new_tile(index)?;
            if self.direction == Direction::Input {
                tile.apply_restrictions(&self.restrictions);
            }
            self.tile_part_estimate += tile.estimated_tile_parts();
            self.tiles.insert(index, tile);
        }
        self.tiles
            .get_mut(&index)
            .ok_or(J2kError::NoSuchTile { tile: index })
    }

    pub fn tile(&self, index: u32) -> Result<&Tile, J2kError> {
        self.tiles.get(&index).ok_or(J2kError::NoSuchTile { tile: index })
    }

    pub fn tile_mut(&mut self, index: u32) -> Result<&mut Tile, J2kError> {
        self.tiles
            .get_mut(&index)
            .ok_or(J2kError::NoSuchTile { tile: index })
    }

    pub fn open_tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.values()
    }

    pub fn recycle_pool_len(&self) -> usize {
        self.recycle_pool.len()
    }

    pub fn store_block(
        &mut self,
        tile: u32,
        component: usize,
        resolution: usize,
        band: usize,
        block: Coords,
        encoding: BlockEncoding,
    ) -> Result<(), J2kError> {
        self.check_direction(Direction::Output)?;
        self.open_tile(tile)?
            .store_block(component, resolution, band, block, encoding)
    }

    /// Runs `f` on each listed tile, in parallel when the `rayon` feature is on. Tiles
    /// share only the precinct server.
    pub fn for_each_tile_parallel<F>(&mut self, tiles: &[u32], f: F) -> Result<(), J2kError>
    where
        F: Fn(&mut Tile) -> Result<(), J2kError> + Send + Sync,
    {
        for &t in tiles {
            self.open_tile(t)?;
        }
        let wanted: BTreeSet<u32> = tiles.iter().copied().collect();
        let mut selected: Vec<&mut Tile> = self
            .tiles
            .values_mut()
            .filter(|t| wanted.contains(&t.index))
            .collect();
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            selected.par_iter_mut().try_for_each(|t| f(&mut **t))
        }
        #[cfg(not(feature = "rayon"))]
        {
            selected.iter_mut().try_for_each(|t| f(&mut **t))
        }
    }

    pub fn write_header(&mut self, target: &mut dyn CompressedTarget) -> Result<(), J2kError> {
        self.check_direction(Direction::Output)?;
        if self.header_written {
            return Ok(());
        }
        self.header_bytes =
            J2kWriter::new(target).write_main_header(&self.params, &self.steps, &self.profile)?;
        self.header_written = true;
        Ok(())
    }

    fn completed_share(&self) -> f64 {
        let total = self.params.num_tiles() as f64;
        let open: f64 = self.tiles.values().map(Tile::ready_fraction).sum();
        ((self.released.len() as f64 + open) / total).min(1.0)
    }

    fn overhead_estimate(&self) -> u64 {
        self.header_bytes
            + self.tile_part_estimate * (SOT_SEGMENT_BYTES + SOD_MARKER_BYTES)
            + MarkerCode::EndOfCodestream.to_bytes().len() as u64
    }

    /// Runs rate control over every ready precinct and writes all tile-parts that can be
    /// generated. Closed tiles whose packets are all written are released.
    pub fn flush(&mut self, target: &mut dyn CompressedTarget) -> Result<FlushReport, J2kError> {
        self.check_direction(Direction::Output)?;
        self.write_header(target)?;
        let start = target.position();
        for tile in self.tiles.values_mut() {
            tile.prepare_output()?;
        }
        let overhead = self.overhead_estimate();
        let fraction = self.completed_share();
        let plan = {
            let mut tiles: Vec<&mut Tile> = self.tiles.values_mut().collect();
            self.rate.plan(&mut tiles, overhead, fraction)?
        };
        let mut report = FlushReport {
            plan,
            ..FlushReport::default()
        };
        for tile in self.tiles.values_mut() {
            loop {
                let tp = tile.generate_tile_part(target)?;
                if tp.bytes == 0 {
                    break;
                }
                report.tile_parts.push(tp);
                if tp.final_part {
                    break;
                }
            }
        }
        report.released = self.release_finished();
        report.bytes = target.position() - start;
        debug!(
            "flush: {} tile-parts, {} bytes",
            report.tile_parts.len(),
            report.bytes
        );
        Ok(report)
    }

    /// Writes one tile-part of `tile` without running rate control.
    pub fn generate_tile_part(
        &mut self,
        tile: u32,
        target: &mut dyn CompressedTarget,
    ) -> Result<TilePartReport, J2kError> {
        self.check_direction(Direction::Output)?;
        self.write_header(target)?;
        self.tile_mut(tile)?.generate_tile_part(target)
    }

    fn release_finished(&mut self) -> Vec<u32> {
        let done: Vec<u32> = self
            .tiles
            .values()
            .filter(|t| {
                t.is_closed()
                    && t.is_complete()
                    && (self.direction == Direction::Output || !self.params.persistent)
            })
            .map(|t| t.index)
            .collect();
        for index in &done {
            if let Some(mut tile) = self.tiles.remove(index) {
                self.last_tile_parts = tile.tile_parts();
                tile.release();
                self.released.insert(*index);
                if tile.typical {
                    self.recycle_pool.push(tile);
                }
            }
        }
        done
    }

    /// Closes a tile. It is released once every relevant packet has been written or
    /// desequenced; persistent input tiles are kept until dropped.
    pub fn close_tile(&mut self, index: u32) -> Result<(), J2kError> {
        self.tile_mut(index)?.close();
        self.release_finished();
        Ok(())
    }

    /// Reopens a closed tile of a persistent input codestream.
    pub fn restart_tile(&mut self, index: u32) -> Result<&mut Tile, J2kError> {
        let tile = self.tile_mut(index)?;
        tile.restart()?;
        Ok(tile)
    }

    fn check_fragment_boundary(&self) -> Result<(), J2kError> {
        if let Some(t) = self.tiles.values().find(|t| !t.is_complete()) {
            return Err(J2kError::InvalidOperation(if t.tile_parts() == 0 {
                "open tile has not been written"
            } else {
                "open tile is only partly written"
            }));
        }
        Ok(())
    }

    /// Flushes, then terminates the codestream with EOC.
    pub fn finish(&mut self, target: &mut dyn CompressedTarget) -> Result<u64, J2kError> {
        self.flush(target)?;
        self.check_fragment_boundary()?;
        let missing = (self.params.num_tiles() as usize).saturating_sub(self.released.len() + self.tiles.len());
        if missing > 0 {
            warn!("{missing} tiles were never written");
        }
        J2kWriter::new(target).write_eoc()?;
        Ok(target.position())
    }

    /// Ends this invocation of a fragmented encode with a resume trailer. Every open
    /// tile must have been completely written.
    pub fn finish_fragment(&mut self, target: &mut dyn CompressedTarget) -> Result<ResumeState, J2kError> {
        self.flush(target)?;
        self.check_fragment_boundary()?;
        for index in self.tiles.keys().copied().collect::<Vec<_>>() {
            self.close_tile(index)?;
        }
        let mut tiles_completed = self.resumed_tiles;
        while self.released.contains(&tiles_completed) {
            tiles_completed += 1;
        }
        let state = ResumeState {
            tiles_completed,
            bytes_written: target.position(),
            last_tile_parts: self.last_tile_parts,
        };
        J2kWriter::new(target).write_resume_trailer(&state)?;
        debug!("fragment ends after tile {tiles_completed}");
        Ok(state)
    }

    /// Restricts what later tile-parts contribute to the application.
    pub fn apply_input_restrictions(&mut self, restrictions: InputRestrictions) -> Result<(), J2kError> {
        self.check_direction(Direction::Input)?;
        if let Some(range) = &restrictions.components {
            if range.end > self.params.components.len() || range.is_empty() {
                return Err(J2kError::ComponentOutOfRange {
                    requested: range.end,
                    available: self.params.components.len(),
                });
            }
        }
        if restrictions.max_layers == Some(0) {
            return Err(J2kError::InvalidParameter {
                name: "max_layers",
                reason: "at least one layer must be kept".into(),
            });
        }
        for tile in self.tiles.values_mut() {
            tile.apply_restrictions(&restrictions);
        }
        self.restrictions = restrictions;
        Ok(())
    }

    pub fn restrictions(&self) -> &InputRestrictions {
        &self.restrictions
    }

    pub fn is_input_exhausted(&self) -> bool {
        self.input_done
    }

    /// Reads the next tile-part and desequences its packets. Returns `None` at the end
    /// of the codestream.
    pub fn read_tile_part(
        &mut self,
        source: &mut dyn CompressedSource,
    ) -> Result<Option<TilePartSummary>, J2kError> {
        self.check_direction(Direction::Input)?;
        if self.input_done {
            return Ok(None);
        }
        let num_tiles = self.params.num_tiles();
        let sot_consumed = std::mem::take(&mut self.sot_pending);
        let header = match J2kParser::new(source).parse_tile_part_header(sot_consumed, num_tiles)? {
            Some(h) => h,
            None => {
                self.input_done = true;
                debug!("end of codestream");
                return Ok(None);
            }
        };

        let body = match header.body_length() {
            Some(len) => {
                let body = source.read_up_to(len as usize)?;
                if (body.len() as u64) < len {
                    if !self.params.resilient {
                        return Err(J2kError::UnexpectedEnd);
                    }
                    warn!(
                        "tile {}: tile-part truncated to {} of {len} bytes",
                        header.tile,
                        body.len()
                    );
                }
                body
            }
            None => {
                // Psot 0: the tile-part runs to EOC.
                let mut rest = Vec::new();
                loop {
                    let chunk = source.read_up_to(READ_CHUNK)?;
                    if chunk.is_empty() {
                        break;
                    }
                    rest.extend_from_slice(&chunk);
                }
                if rest.ends_with(&MarkerCode::EndOfCodestream.to_bytes()) {
                    rest.truncate(rest.len() - 2);
                }
                self.input_done = true;
                rest
            }
        };

        let seekable = source.supports_seek();
        if seekable && self.params.persistent && header.packet_lengths.is_none() {
            self.profile.note(ProfileCause::MissingPacketLengths);
        }
        let index = header.tile as u32;
        if self.released.contains(&index) {
            // Only irrelevant packets can follow the part that completed a released tile.
            debug!("tile {index}: part {} of a released tile dropped", header.part_index);
            let read = TilePartRead {
                abandoned_bytes: body.len() as u64,
                ..TilePartRead::default()
            };
            return Ok(Some(TilePartSummary { header, read }));
        }
        let tile = self.open_tile(index)?;
        let read = tile.read_tile_part(&header, &body, seekable)?;
        self.release_finished();
        Ok(Some(TilePartSummary { header, read }))
    }

    /// Reads tile-parts until the end of the codestream.
    pub fn read_all(&mut self, source: &mut dyn CompressedSource) -> Result<Vec<TilePartSummary>, J2kError> {
        let mut out = Vec::new();
        while let Some(summary) = self.read_tile_part(source)? {
            out.push(summary);
        }
        Ok(out)
    }

    pub fn retrieve_block(
        &self,
        tile: u32,
        component: usize,
        resolution: usize,
        band: usize,
        block: Coords,
    ) -> Result<ReceivedBlock, J2kError> {
        self.tile(tile)?
            .retrieve_block(component, resolution, band, block)
    }

    /// Opens a precinct, reloading it from `source` if it was evicted.
    pub fn open_precinct(
        &mut self,
        tile: u32,
        component: usize,
        resolution: usize,
        position: Coords,
        source: &mut dyn CompressedSource,
    ) -> Result<PrecinctId, J2kError> {
        let id = self
            .tile_mut(tile)?
            .open_precinct(component, resolution, position, Some(source))?;
        self.evict_inactive();
        Ok(id)
    }

    pub fn close_precinct(
        &mut self,
        tile: u32,
        component: usize,
        resolution: usize,
        position: Coords,
    ) -> Result<(), J2kError> {
        self.tile_mut(tile)?
            .close_precinct(component, resolution, position)?;
        self.evict_inactive();
        Ok(())
    }

    /// Evicts the oldest inactive precincts while the inactive list is over budget.
    pub fn evict_inactive(&mut self) -> usize {
        let budget = self.params.precinct_memory_budget;
        let mut evicted = 0;
        while let Some(entry) = self.server.pop_inactive_over_budget(budget) {
            if let Some(tile) = self.tiles.get_mut(&entry.tile) {
                if tile.evict_precinct(&entry) {
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            debug!("evicted {evicted} inactive precincts");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_reader::MemorySource;
    use crate::stream_writer::MemoryTarget;

    fn params() -> CodingParams {
        let mut p = CodingParams::new(64, 32, 1);
        p.tile_width = 32;
        p.tile_height = 32;
        p.style.levels = 1;
        p.style.block_width_exponent = 4;
        p.style.block_height_exponent = 4;
        p
    }

    fn encoding(seed: u8) -> BlockEncoding {
        let bytes: Vec<u8> = (0..16u8).map(|i| (i * 3 + seed) & 0x7F).collect();
        BlockEncoding::new(bytes, vec![8, 16], vec![40000, 30000], 1).unwrap()
    }

    fn fill(cs: &mut Codestream, tile: u32) {
        let t = cs.open_tile(tile).unwrap();
        for r in 0..2 {
            let bands = t.component(0).unwrap().resolution(r).unwrap().subbands.clone();
            for b in &bands {
                for i in 0..b.block_indices.area() as usize {
                    let idx = b.block_indices.position_of(i);
                    t.store_block(0, r, b.index, idx, encoding(i as u8)).unwrap();
                }
            }
        }
        t.close();
    }

    #[test]
    fn test_output_then_input() {
        let mut cs = Codestream::create_output(params()).unwrap();
        let mut out = MemoryTarget::new();
        fill(&mut cs, 0);
        fill(&mut cs, 1);
        let report = cs.flush(&mut out).unwrap();
        assert_eq!(report.tile_parts.len(), 2);
        assert_eq!(report.released, vec![0, 1]);
        assert_eq!(cs.recycle_pool_len(), 2);
        cs.finish(&mut out).unwrap();
        assert!(matches!(cs.open_tile(0), Err(J2kError::TileClosed { tile: 0 })));

        let mut src = MemorySource::new(out.into_inner());
        let mut input = Codestream::open_input(&mut src).unwrap();
        let parts = input.read_all(&mut src).unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.read.parsed == 2 && p.read.skipped == 0));
        assert!(input.is_input_exhausted());
        let got = input.retrieve_block(0, 0, 0, 0, Coords::new(0, 0)).unwrap();
        assert_eq!(got.bytes, encoding(0).bytes);
    }

    #[test]
    fn test_input_tile_closed_between_tile_parts() {
        let mut p = params();
        p.tile_part_division = crate::coding_parameters::TilePartDivision::RESOLUTION;
        let mut cs = Codestream::create_output(p).unwrap();
        let mut out = MemoryTarget::new();
        fill(&mut cs, 0);
        fill(&mut cs, 1);
        assert_eq!(cs.flush(&mut out).unwrap().tile_parts.len(), 4);
        cs.finish(&mut out).unwrap();

        let mut src = MemorySource::new(out.into_inner());
        let mut input = Codestream::open_input(&mut src).unwrap();
        let first = input.read_tile_part(&mut src).unwrap().unwrap();
        assert_eq!((first.header.tile, first.header.part_index), (0, 0));
        assert!(!input.tile(0).unwrap().is_complete());

        // Closing only marks the tile; its remaining packets must still be read.
        input.close_tile(0).unwrap();
        assert!(input.tile(0).unwrap().is_closed());

        let second = input.read_tile_part(&mut src).unwrap().unwrap();
        assert_eq!((second.header.tile, second.header.part_index), (0, 1));
        assert_eq!(second.read.parsed, 1);
        assert!(matches!(input.tile(0), Err(J2kError::NoSuchTile { tile: 0 })));
        assert!(matches!(input.open_tile(0), Err(J2kError::TileClosed { tile: 0 })));
        assert_eq!(input.recycle_pool_len(), 1);

        let rest = input.read_all(&mut src).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|s| s.header.tile == 1 && s.read.parsed == 1));
        assert!(input.tile(1).is_ok());
    }

    #[test]
    fn test_direction_is_enforced() {
        let mut cs = Codestream::create_output(params()).unwrap();
        assert!(cs.apply_input_restrictions(InputRestrictions::default()).is_err());
        let mut src = MemorySource::new(Vec::new());
        assert!(cs.read_tile_part(&mut src).is_err());
        assert!(matches!(cs.open_tile(2), Err(J2kError::NoSuchTile { tile: 2 })));
    }

    #[test]
    fn test_finish_rejects_unwritten_tile() {
        let mut cs = Codestream::create_output(params()).unwrap();
        let mut out = MemoryTarget::new();
        cs.open_tile(0).unwrap();
        assert!(cs.finish(&mut out).is_err());
    }
}

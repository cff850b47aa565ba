//! Post-compression rate control.
//!
//! Each quality layer gets one distortion-length slope threshold for the whole flush.
//! Layer byte targets are cumulative codestream sizes; the controller searches the
//! 16-bit slope range for the smallest threshold whose packets (plus the bytes spent on
//! headers and earlier layers) still fit, then finalizes every ready precinct at it.

use super::packet::{simulate_packet, simulate_packet_cbr};
use super::precinct::Precinct;
use super::tile::Tile;
use super::writer::plt_bytes;
use crate::coding_parameters::RateParams;
use crate::constants::MAXIMUM_SLOPE_THRESHOLD;
use crate::error::J2kError;
use log::{debug, trace};

/// What one flush decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushPlan {
    pub thresholds: Vec<u16>,
    /// Bytes finalized in this flush per layer: packets plus their PLT entries.
    pub layer_bytes: Vec<u64>,
    pub precincts: usize,
}

impl FlushPlan {
    pub fn total_bytes(&self) -> u64 {
        self.layer_bytes.iter().sum()
    }
}

#[derive(Debug, Clone)]
pub struct RateController {
    num_layers: u16,
    params: RateParams,
    /// Cumulative codestream byte limit after each layer.
    targets: Vec<u64>,
    /// Packet bytes of each layer finalized by earlier flushes.
    committed: Vec<u64>,
    /// Non-packet bytes accounted for by earlier flushes.
    committed_overhead: u64,
    last_thresholds: Vec<u16>,
}

fn candidate(p: &Precinct, layer: u16) -> bool {
    p.is_ready() && p.finalized_layers == layer
}

impl RateController {
    pub fn new(num_layers: u16, params: &RateParams) -> Self {
        Self {
            num_layers,
            params: params.clone(),
            targets: Vec::new(),
            committed: vec![0; num_layers as usize],
            committed_overhead: 0,
            last_thresholds: Vec::new(),
        }
    }

    /// Cumulative byte limits, one per layer starting with the first. Layers past the
    /// end of the list fall back to slope thresholds.
    pub fn set_max_bytes(&mut self, targets: &[u64]) -> Result<(), J2kError> {
        if targets.len() > self.num_layers as usize {
            return Err(J2kError::InvalidParameter {
                name: "max_bytes",
                reason: format!("{} targets for {} layers", targets.len(), self.num_layers),
            });
        }
        if targets.windows(2).any(|w| w[1] < w[0]) || targets.first() == Some(&0) {
            return Err(J2kError::InvalidParameter {
                name: "max_bytes",
                reason: "layer targets must be positive and non-decreasing".into(),
            });
        }
        self.targets = targets.to_vec();
        Ok(())
    }

    pub fn targets(&self) -> &[u64] {
        &self.targets
    }

    /// Passes whose slope is below `threshold` are never included.
    pub fn set_min_slope_threshold(&mut self, threshold: u16) {
        self.params.min_slope_threshold = threshold;
    }

    pub fn min_slope_threshold(&self) -> u16 {
        self.params.min_slope_threshold
    }

    pub fn set_cbr_bytes(&mut self, bytes: Option<u64>) {
        self.params.cbr_bytes = bytes;
    }

    pub fn last_thresholds(&self) -> &[u16] {
        &self.last_thresholds
    }

    /// Packet bytes finalized so far, per layer.
    pub fn committed_bytes(&self) -> &[u64] {
        &self.committed
    }

    fn default_threshold(&self, layer: u16) -> u16 {
        if let Some(&t) = self.params.layer_thresholds.get(layer as usize) {
            return t.max(self.params.min_slope_threshold);
        }
        let min = self.params.min_slope_threshold as u64;
        let span = MAXIMUM_SLOPE_THRESHOLD as u64 - min;
        let step = span * (layer as u64 + 1) / self.num_layers as u64;
        (MAXIMUM_SLOPE_THRESHOLD as u64 - step) as u16
    }

    fn measure(tiles: &mut [&mut Tile], layer: u16, threshold: u16) -> Result<u64, J2kError> {
        let mut total = 0;
        for tile in tiles.iter_mut() {
            let opts = tile.packet_options();
            let plt = tile.writes_plt();
            let mut lengths = Vec::new();
            for p in tile.precincts_mut() {
                if !candidate(p, layer) {
                    continue;
                }
                let n = simulate_packet(p, layer, threshold, None, false, &opts)?;
                total += n;
                if plt {
                    lengths.push(n);
                }
            }
            total += plt_bytes(&lengths);
        }
        Ok(total)
    }

    /// Smallest threshold whose layer fits in `budget`; `None` when even the largest
    /// threshold does not.
    fn search(
        &self,
        tiles: &mut [&mut Tile],
        layer: u16,
        budget: i64,
    ) -> Result<(u16, Option<u64>), J2kError> {
        let mut lo = self.params.min_slope_threshold;
        let mut hi = MAXIMUM_SLOPE_THRESHOLD;
        let mut best = Self::measure(tiles, layer, hi)?;
        if best as i64 > budget {
            return Ok((hi, None));
        }
        let tolerance = (budget as f64 * self.params.tolerance) as i64;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let bytes = Self::measure(tiles, layer, mid)?;
            trace!("layer {layer}: threshold {mid} gives {bytes} bytes of {budget}");
            if bytes as i64 <= budget {
                hi = mid;
                best = bytes;
                if budget - (bytes as i64) <= tolerance {
                    break;
                }
            } else {
                lo = mid + 1;
            }
        }
        Ok((hi, Some(best)))
    }

    /// Finalizes `layer` at `threshold`. With `slack`, precincts in scan order may take
    /// passes from the next lower threshold while the slack lasts.
    fn finalize_layer(
        tiles: &mut [&mut Tile],
        layer: u16,
        threshold: u16,
        mut slack: u64,
        trim: bool,
    ) -> Result<u64, J2kError> {
        let mut total = 0;
        for tile in tiles.iter_mut() {
            let opts = tile.packet_options();
            let plt = tile.writes_plt();
            let mut lengths = Vec::new();
            for p in tile.precincts_mut() {
                if !candidate(p, layer) {
                    continue;
                }
                if trim && slack > 0 && threshold > 0 {
                    let at = simulate_packet(p, layer, threshold, None, false, &opts)?;
                    let limit = at + slack;
                    let lower = simulate_packet(p, layer, threshold - 1, Some(limit), false, &opts)?;
                    if lower <= limit && lower >= at {
                        lengths.push(simulate_packet(p, layer, threshold - 1, Some(limit), true, &opts)?);
                        slack = limit - lower;
                        continue;
                    }
                }
                lengths.push(simulate_packet(p, layer, threshold, None, true, &opts)?);
            }
            total += lengths.iter().sum::<u64>();
            if plt {
                total += plt_bytes(&lengths);
            }
        }
        Ok(total)
    }

    /// Pads the last layer with filler so the flush comes to `slack` more bytes. Length
    /// markers are sized at the threshold, before padding.
    fn finalize_cbr(
        tiles: &mut [&mut Tile],
        layer: u16,
        threshold: u16,
        mut slack: u64,
    ) -> Result<u64, J2kError> {
        let mut total = 0;
        for tile in tiles.iter_mut() {
            let opts = tile.packet_options();
            let plt = tile.writes_plt();
            let mut lengths = Vec::new();
            for p in tile.precincts_mut() {
                if !candidate(p, layer) {
                    continue;
                }
                let at = simulate_packet(p, layer, threshold, None, false, &opts)?;
                let got = simulate_packet_cbr(p, layer, threshold, at + slack, true, &opts)?;
                slack = (at + slack).saturating_sub(got);
                lengths.push(got);
            }
            total += lengths.iter().sum::<u64>();
            if plt {
                total += plt_bytes(&lengths);
            }
        }
        Ok(total)
    }

    /// Finalizes every layer of every ready precinct not yet planned.
    ///
    /// `overhead` counts the non-packet bytes of the codestream up to the end of this
    /// flush (main header, tile-part headers, the final EOC). `fraction` is the share of
    /// the image whose precincts are ready; byte targets are scaled by it so that early
    /// flushes leave room for what is still to come.
    pub fn plan(
        &mut self,
        tiles: &mut [&mut Tile],
        overhead: u64,
        fraction: f64,
    ) -> Result<FlushPlan, J2kError> {
        let precincts = tiles
            .iter()
            .map(|t| t.precincts().filter(|p| candidate(p, 0)).count())
            .sum();
        let mut plan = FlushPlan {
            precincts,
            ..FlushPlan::default()
        };
        if precincts == 0 {
            return Ok(plan);
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let flush_overhead = overhead.saturating_sub(self.committed_overhead);
        let mut flushed = 0u64;
        for layer in 0..self.num_layers {
            let l = layer as usize;
            let last = layer + 1 == self.num_layers;
            let cbr = self.params.cbr_bytes.filter(|_| last);
            let budget = match (cbr, self.targets.get(l)) {
                (Some(n), _) => Some(n as i64 - flush_overhead as i64 - flushed as i64),
                (None, Some(&target)) => {
                    let earlier: u64 = self.committed[..=l].iter().sum();
                    Some(
                        (target as f64 * fraction) as i64
                            - overhead as i64
                            - earlier as i64
                            - flushed as i64,
                    )
                }
                (None, None) => None,
            };
            let (threshold, bytes) = match budget {
                Some(budget) => {
                    let (threshold, fit) = self.search(tiles, layer, budget)?;
                    let slack = fit.map_or(0, |b| (budget - b as i64).max(0) as u64);
                    let bytes = if cbr.is_some() {
                        Self::finalize_cbr(tiles, layer, threshold, slack)?
                    } else {
                        Self::finalize_layer(tiles, layer, threshold, slack, self.params.trim_to_limit)?
                    };
                    (threshold, bytes)
                }
                None => {
                    let threshold = self.default_threshold(layer);
                    (threshold, Self::finalize_layer(tiles, layer, threshold, 0, false)?)
                }
            };
            debug!("layer {layer}: threshold {threshold}, {bytes} packet bytes");
            plan.thresholds.push(threshold);
            plan.layer_bytes.push(bytes);
            self.committed[l] += bytes;
            flushed += bytes;
        }
        self.committed_overhead = overhead;
        self.last_thresholds = plan.thresholds.clone();
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding_parameters::CodingParams;
    use crate::jpeg2000::code_block::BlockEncoding;
    use crate::jpeg2000::geometry::Coords;
    use crate::jpeg2000::precinct_server::PrecinctServer;
    use crate::profile::ProfileMonitor;
    use std::sync::Arc;

    fn encoding(seed: u8) -> BlockEncoding {
        let bytes: Vec<u8> = (0..120u32).map(|i| ((i * 7 + seed as u32) % 0x7F) as u8).collect();
        let passes: Vec<u32> = (1..=12).map(|i| i * 10).collect();
        let slopes: Vec<u16> = (0..12).map(|i| 60000 - i * 2500 - seed as u16 * 10).collect();
        BlockEncoding::new(bytes, passes, slopes, 1).unwrap()
    }

    fn ready_tile(layers: u16) -> Tile {
        let mut p = CodingParams::new(64, 64, 1);
        p.style.levels = 2;
        p.style.block_width_exponent = 4;
        p.style.block_height_exponent = 4;
        p.num_layers = layers;
        let mut t = Tile::new(
            0,
            Arc::new(p),
            Arc::new(PrecinctServer::new()),
            Arc::new(ProfileMonitor::new()),
        )
        .unwrap();
        for r in 0..3 {
            let bands = t.component(0).unwrap().resolution(r).unwrap().subbands.clone();
            for b in &bands {
                for i in 0..b.block_indices.area() as usize {
                    let idx: Coords = b.block_indices.position_of(i);
                    t.store_block(0, r, b.index, idx, encoding((r * 10 + i) as u8)).unwrap();
                }
            }
        }
        t
    }

    #[test]
    fn test_layer_targets_are_met() {
        let mut tile = ready_tile(3);
        let mut rc = RateController::new(3, &RateParams::default());
        rc.set_max_bytes(&[300, 900, 1600]).unwrap();
        let overhead = 100;
        let plan = rc.plan(&mut [&mut tile], overhead, 1.0).unwrap();
        assert_eq!(plan.thresholds.len(), 3);
        assert!(plan.thresholds.windows(2).all(|w| w[1] <= w[0]));
        let mut cumulative = overhead;
        for (l, target) in [300u64, 900, 1600].iter().enumerate() {
            cumulative += plan.layer_bytes[l];
            assert!(cumulative <= *target, "layer {l}: {cumulative} > {target}");
        }
        assert!(tile.precincts().all(|p| p.finalized_layers == 3));
        // Nothing left to plan.
        assert_eq!(rc.plan(&mut [&mut tile], overhead, 1.0).unwrap().precincts, 0);
    }

    #[test]
    fn test_without_targets_uses_spread_thresholds() {
        let mut tile = ready_tile(2);
        let mut rc = RateController::new(2, &RateParams::default());
        let plan = rc.plan(&mut [&mut tile], 0, 1.0).unwrap();
        assert_eq!(plan.thresholds, vec![MAXIMUM_SLOPE_THRESHOLD - 32767, 0]);
        // The last layer carries every pass.
        assert!(
            tile.precincts()
                .flat_map(|p| p.storage.blocks.iter())
                .all(|b| b.layer_passes.last().copied() == b.encoding.as_ref().map(|e| e.num_passes()))
        );
    }

    #[test]
    fn test_cbr_fills_flush() {
        let mut tile = ready_tile(1);
        let mut rc = RateController::new(1, &RateParams::default());
        rc.set_cbr_bytes(Some(5000));
        let plan = rc.plan(&mut [&mut tile], 200, 1.0).unwrap();
        let produced = plan.total_bytes() + 200;
        assert!(produced <= 5000 && 5000 - produced <= 8, "{produced}");
    }

    #[test]
    fn test_rejects_bad_targets() {
        let mut rc = RateController::new(2, &RateParams::default());
        assert!(rc.set_max_bytes(&[10, 5]).is_err());
        assert!(rc.set_max_bytes(&[1, 2, 3]).is_err());
        assert!(rc.set_max_bytes(&[5, 5]).is_ok());
    }
}

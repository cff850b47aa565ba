use crate::coding_parameters::{ComponentInfo, ComponentStyle};
use crate::error::J2kError;
use crate::jpeg2000::decomposition::DecompositionTree;
use crate::jpeg2000::geometry::{Coords, Partition, Rect};
use crate::jpeg2000::kernel::Branch;
use crate::jpeg2000::quantization::{QuantStep, quality_limited_passes};

/// Inputs shared by all subbands of one resolution.
pub struct SubbandContext<'a> {
    pub style: &'a ComponentStyle,
    pub info: &'a ComponentInfo,
    pub resolution: usize,
    pub reversible: bool,
    /// Energy gain of the multi-component synthesis for this component.
    pub g_tc: f64,
    pub precinct_partition: Partition,
}

/// A leaf of a decomposition tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Subband {
    pub index: usize,
    pub node: usize,
    pub rect: Rect,
    pub orientation: (Branch, Branch),
    pub range_bits: u8,
    pub step: QuantStep,
    /// Step size relative to a unit nominal range.
    pub delta: f64,
    pub magnitude_bits: u8,
    pub roi_shift: u8,
    pub roi_weight: f32,
    pub visual_weight: f32,
    pub energy_gain: f64,
    /// Distortion weight used to turn squared errors into slopes.
    pub rd_weight: f64,
    pub precinct_partition: Partition,
    pub block_partition: Partition,
    pub block_indices: Rect,
    pub max_passes: u16,
    /// The precinct cell forced a block smaller than the nominal size.
    pub block_clipped: bool,
}

impl Subband {
    pub fn new(index: usize, tree: &DecompositionTree, ctx: &SubbandContext) -> Result<Self, J2kError> {
        let node_idx = tree.bands[index];
        let node = &tree.nodes[node_idx];
        let local = tree.local_descriptor(node_idx);

        let mut precinct = ctx.precinct_partition;
        for (&bx, &by) in local.x.iter().zip(local.y.iter()) {
            precinct = precinct
                .descend(bx.is_split(), bx.is_high(), by.is_split(), by.is_high())
                .ok_or(J2kError::InvalidPartition {
                    what: "precinct",
                    width: ctx.precinct_partition.size.x,
                    height: ctx.precinct_partition.size.y,
                    origin_x: ctx.precinct_partition.origin.x,
                    origin_y: ctx.precinct_partition.origin.y,
                })?;
        }

        let nominal = Coords::new(
            1i64 << ctx.style.block_width_exponent,
            1i64 << ctx.style.block_height_exponent,
        );
        let block_size = Coords::new(nominal.x.min(precinct.size.x), nominal.y.min(precinct.size.y));
        let block_partition = Partition::new("code-block", precinct.origin, block_size)?;

        let high = node.high_pass_count();
        let range_bits = ctx.info.precision + high;
        let energy_gain = node.energy_gain;
        let (step, delta) = if ctx.reversible {
            (QuantStep::reversible(range_bits), 1.0 / (1u64 << ctx.info.precision) as f64)
        } else {
            let scale = (1u64 << ctx.info.precision.min(62)) as f64;
            let wanted = ctx.style.base_step as f64 / energy_gain.sqrt();
            let step = QuantStep::from_delta(wanted * scale, range_bits);
            (step, step.delta(range_bits) / scale)
        };
        let magnitude_bits = step.magnitude_bits(ctx.style.guard_bits) + ctx.style.roi_shift;
        let visual_weight = ctx.style.visual_weight(ctx.resolution);
        let rd_weight = energy_gain * delta * delta * visual_weight as f64 * ctx.g_tc;

        Ok(Self {
            index,
            node: node_idx,
            rect: node.rect,
            orientation: (node.branch_x, node.branch_y),
            range_bits,
            step,
            delta,
            magnitude_bits,
            roi_shift: ctx.style.roi_shift,
            roi_weight: ctx.style.roi_weight,
            visual_weight,
            energy_gain,
            rd_weight,
            precinct_partition: precinct,
            block_partition,
            block_indices: block_partition.indices(&node.rect),
            max_passes: quality_limited_passes(magnitude_bits, delta, ctx.style.quality_limit_step),
            block_clipped: block_size != nominal,
        })
    }

    /// Follows a repositioned tree; quantization and partitions are position independent.
    pub fn reposition(&mut self, tree: &DecompositionTree) {
        self.rect = tree.nodes[self.node].rect;
        self.block_indices = self.block_partition.indices(&self.rect);
    }

    /// Band region covered by precinct `precinct`.
    pub fn precinct_region(&self, precinct: Coords) -> Rect {
        self.precinct_partition.cell(precinct).intersect(&self.rect)
    }

    /// Block indices inside precinct `precinct`.
    pub fn blocks_in_precinct(&self, precinct: Coords) -> Rect {
        let region = self.precinct_region(precinct);
        self.block_partition.indices(&region)
    }

    pub fn block_rect(&self, block: Coords) -> Rect {
        self.block_partition.cell(block).intersect(&self.rect)
    }

    pub fn is_empty(&self) -> bool {
        self.rect.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jpeg2000::decomposition::{DecompositionCode, subband_descriptor};
    use crate::jpeg2000::kernel::{KernelDescription, KernelId};

    fn tree(rect: Rect) -> DecompositionTree {
        let code = DecompositionCode::MALLAT;
        DecompositionTree::build(
            rect,
            code,
            vec![],
            vec![],
            &KernelDescription::new(KernelId::Reversible53),
            &subband_descriptor(code),
        )
        .unwrap()
    }

    #[test]
    fn test_band_partitions() {
        let style = ComponentStyle {
            block_width_exponent: 4,
            block_height_exponent: 4,
            ..ComponentStyle::default()
        };
        let info = ComponentInfo::default();
        let t = tree(Rect::new(0, 0, 64, 64));
        let ctx = SubbandContext {
            style: &style,
            info: &info,
            resolution: 1,
            reversible: true,
            g_tc: 1.0,
            precinct_partition: Partition::new("precinct", Coords::new(0, 0), Coords::new(16, 16))
                .unwrap(),
        };
        let hl = Subband::new(0, &t, &ctx).unwrap();
        assert_eq!(hl.precinct_partition.size, Coords::new(8, 8));
        assert_eq!(hl.block_partition.size, Coords::new(8, 8));
        assert!(hl.block_clipped);
        assert_eq!(hl.block_indices, Rect::new(0, 0, 4, 4));
        assert_eq!(hl.range_bits, 9);
        assert_eq!(hl.magnitude_bits, 10);
        assert_eq!(hl.blocks_in_precinct(Coords::new(1, 2)), Rect::new(1, 2, 2, 3));
    }

    #[test]
    fn test_irreversible_step_follows_energy() {
        let style = ComponentStyle {
            kernel: KernelId::Irreversible97,
            reversible: false,
            base_step: 1.0 / 256.0,
            ..ComponentStyle::default()
        };
        let info = ComponentInfo::default();
        let code = DecompositionCode::MALLAT;
        let t = DecompositionTree::build(
            Rect::new(0, 0, 32, 32),
            code,
            vec![],
            vec![],
            &KernelDescription::new(KernelId::Irreversible97),
            &subband_descriptor(code),
        )
        .unwrap();
        let ctx = SubbandContext {
            style: &style,
            info: &info,
            resolution: 1,
            reversible: false,
            g_tc: 1.0,
            precinct_partition: Partition::new("precinct", Coords::new(0, 0), Coords::new(1 << 15, 1 << 15))
                .unwrap(),
        };
        let hl = Subband::new(0, &t, &ctx).unwrap();
        let hh = Subband::new(2, &t, &ctx).unwrap();
        // Lower synthesis gain means a coarser step.
        assert!(hh.delta > hl.delta);
        let expected = 1.0 / 256.0 / hl.energy_gain.sqrt();
        assert!((hl.delta - expected).abs() / expected < 1.0 / 1024.0);
        assert!((hl.rd_weight - hl.energy_gain * hl.delta * hl.delta).abs() < 1e-15);
    }

    #[test]
    fn test_too_small_precinct_is_rejected() {
        let style = ComponentStyle::default();
        let info = ComponentInfo::default();
        let t = tree(Rect::new(0, 0, 8, 8));
        let ctx = SubbandContext {
            style: &style,
            info: &info,
            resolution: 1,
            reversible: true,
            g_tc: 1.0,
            precinct_partition: Partition::new("precinct", Coords::new(0, 0), Coords::new(1, 1)).unwrap(),
        };
        assert!(matches!(
            Subband::new(0, &t, &ctx),
            Err(J2kError::InvalidPartition { what: "precinct", .. })
        ));
    }
}

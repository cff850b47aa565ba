use crate::coding_parameters::{ComponentInfo, ComponentStyle};
use crate::error::J2kError;
use crate::jpeg2000::decomposition::{DecompositionTree, subband_descriptor};
use crate::jpeg2000::geometry::{Coords, Partition, Rect};
use crate::jpeg2000::kernel::{Branch, KernelDescription};
use crate::jpeg2000::notifier::ResolutionNotifier;
use crate::jpeg2000::precinct::PrecinctRef;
use crate::jpeg2000::subband::{Subband, SubbandContext};
use std::sync::Arc;

/// Precinct references are kept for every position of a resolution; beyond this the
/// tile is better split.
const MAXIMUM_PRECINCTS_PER_RESOLUTION: i64 = 1 << 28;

/// Everything needed to build one resolution of a tile-component.
pub struct ResolutionSpec<'a> {
    pub index: usize,
    pub rect: Rect,
    pub root_path_x: Vec<Branch>,
    pub root_path_y: Vec<Branch>,
    pub hor_depth: u8,
    pub vert_depth: u8,
    pub style: &'a ComponentStyle,
    pub info: &'a ComponentInfo,
    pub kernel: &'a KernelDescription,
    pub partition_origin: Coords,
    pub g_tc: f64,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub index: usize,
    /// DWT level that splits this resolution; 0 for the lowest resolution.
    pub dwt_level: u8,
    /// Horizontal and vertical splits between this resolution and full resolution.
    pub hor_depth: u8,
    pub vert_depth: u8,
    pub rect: Rect,
    pub tree: DecompositionTree,
    pub subbands: Vec<Subband>,
    pub precinct_partition: Partition,
    pub precinct_indices: Rect,
    pub precinct_refs: Vec<PrecinctRef>,
    /// Upper bound on the code-blocks of any precinct of this resolution.
    pub max_blocks_per_precinct: u32,
    pub can_flip: bool,
    /// Precinct indices intersecting the region of interest.
    pub relevant_precincts: Rect,
    pub notifier: Arc<ResolutionNotifier>,
}

impl Resolution {
    pub fn new(spec: &ResolutionSpec) -> Result<Self, J2kError> {
        let lowest = spec.index == 0;
        let dwt_level = if lowest {
            0
        } else {
            (spec.style.num_resolutions() - spec.index) as u8
        };
        let tree = if lowest {
            DecompositionTree::lowest(
                spec.rect,
                spec.root_path_x.clone(),
                spec.root_path_y.clone(),
                spec.kernel,
            )
        } else {
            let code = spec.style.decomposition_code(dwt_level);
            DecompositionTree::build(
                spec.rect,
                code,
                spec.root_path_x.clone(),
                spec.root_path_y.clone(),
                spec.kernel,
                &subband_descriptor(code),
            )?
        };

        let (ppx, ppy) = spec.style.precinct_exponents_for(spec.index);
        let precinct_partition = Partition::new(
            "precinct",
            spec.partition_origin,
            Coords::new(1i64 << ppx, 1i64 << ppy),
        )?;
        let ctx = SubbandContext {
            style: spec.style,
            info: spec.info,
            resolution: spec.index,
            reversible: spec.style.reversible,
            g_tc: spec.g_tc,
            precinct_partition,
        };
        let subbands = (0..tree.bands.len())
            .map(|b| Subband::new(b, &tree, &ctx))
            .collect::<Result<Vec<_>, _>>()?;

        let can_flip = tree.can_flip;
        let mut res = Self {
            index: spec.index,
            dwt_level,
            hor_depth: spec.hor_depth,
            vert_depth: spec.vert_depth,
            rect: spec.rect,
            tree,
            subbands,
            precinct_partition,
            precinct_indices: Rect::default(),
            precinct_refs: Vec::new(),
            max_blocks_per_precinct: 0,
            can_flip,
            relevant_precincts: Rect::default(),
            notifier: Arc::new(ResolutionNotifier::new(&[])),
        };
        res.max_blocks_per_precinct = res
            .subbands
            .iter()
            .map(|b| {
                // Blocks are aligned to the precinct grid and never larger than a cell.
                let bx = b.precinct_partition.size.x / b.block_partition.size.x;
                let by = b.precinct_partition.size.y / b.block_partition.size.y;
                (bx * by).min(u32::MAX as i64) as u32
            })
            .sum();
        res.place()?;
        Ok(res)
    }

    /// Recomputes everything that depends on the resolution's position.
    fn place(&mut self) -> Result<(), J2kError> {
        self.precinct_indices = self.precinct_partition.indices(&self.rect);
        let count = self.precinct_indices.area();
        if count > MAXIMUM_PRECINCTS_PER_RESOLUTION {
            return Err(J2kError::TooManyPrecincts(format!(
                "{count} precincts in resolution {}",
                self.index
            )));
        }
        self.precinct_refs.clear();
        self.precinct_refs
            .resize(count as usize, PrecinctRef::UNALLOCATED);
        self.relevant_precincts = self.precinct_indices;
        let rows: Vec<Vec<u32>> = self
            .subbands
            .iter()
            .map(|b| {
                let r = b.block_indices;
                vec![r.width() as u32; r.height() as usize]
            })
            .collect();
        self.notifier = Arc::new(ResolutionNotifier::new(&rows));
        Ok(())
    }

    /// Moves the resolution to `rect`, keeping all position-independent state.
    pub fn reposition(&mut self, rect: Rect) -> Result<(), J2kError> {
        self.rect = rect;
        self.tree.reposition(rect);
        for band in &mut self.subbands {
            band.reposition(&self.tree);
        }
        self.place()
    }

    pub fn num_precincts(&self) -> usize {
        self.precinct_refs.len()
    }

    /// Slot of precinct `p` (absolute precinct indices) in `precinct_refs`.
    pub fn precinct_slot(&self, p: Coords) -> Option<usize> {
        if !self.precinct_indices.contains(p) {
            return None;
        }
        Some(self.precinct_indices.raster_index(p))
    }

    /// Resolution region covered by precinct `p`.
    pub fn precinct_region(&self, p: Coords) -> Rect {
        self.precinct_partition.cell(p).intersect(&self.rect)
    }

    /// Precinct holding block `block` of band `band`.
    pub fn precinct_of_block(&self, band: usize, block: Coords) -> Option<Coords> {
        let b = self.subbands.get(band)?;
        if !b.block_indices.contains(block) {
            return None;
        }
        let cell = b.block_partition.cell(block).intersect(&b.rect);
        Some(b.precinct_partition.cell_of(cell.origin()))
    }

    pub fn blocks_in_precinct(&self, p: Coords) -> usize {
        self.subbands
            .iter()
            .map(|b| b.blocks_in_precinct(p).area() as usize)
            .sum()
    }

    /// Restricts relevance to precincts meeting `region`, given in this resolution's
    /// coordinates. An empty region leaves nothing relevant.
    pub fn restrict(&mut self, region: &Rect) {
        let r = region.intersect(&self.rect);
        self.relevant_precincts = if r.is_empty() {
            Rect::default()
        } else {
            self.precinct_partition.indices(&r)
        };
    }

    pub fn is_relevant(&self, p: Coords) -> bool {
        self.relevant_precincts.contains(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jpeg2000::kernel::KernelId;

    fn spec<'a>(
        style: &'a ComponentStyle,
        info: &'a ComponentInfo,
        kernel: &'a KernelDescription,
        rect: Rect,
    ) -> ResolutionSpec<'a> {
        ResolutionSpec {
            index: 1,
            rect,
            root_path_x: vec![],
            root_path_y: vec![],
            hor_depth: 0,
            vert_depth: 0,
            style,
            info,
            kernel,
            partition_origin: Coords::new(0, 0),
            g_tc: 1.0,
        }
    }

    #[test]
    fn test_precinct_grid() {
        let style = ComponentStyle {
            levels: 1,
            block_width_exponent: 3,
            block_height_exponent: 3,
            precinct_exponents: vec![(4, 4), (4, 4)],
            ..ComponentStyle::default()
        };
        let info = ComponentInfo::default();
        let kernel = KernelDescription::new(KernelId::Reversible53);
        let res = Resolution::new(&spec(&style, &info, &kernel, Rect::new(0, 0, 40, 24))).unwrap();
        assert_eq!(res.precinct_indices, Rect::new(0, 0, 3, 2));
        assert_eq!(res.num_precincts(), 6);
        // Subband precincts are 8x8, blocks 8x8: one block per band.
        assert_eq!(res.max_blocks_per_precinct, 3);
        assert_eq!(res.blocks_in_precinct(Coords::new(0, 0)), 3);
        assert_eq!(res.precinct_of_block(0, Coords::new(1, 1)), Some(Coords::new(1, 1)));
        assert_eq!(res.notifier.num_bands(), 3);
    }

    #[test]
    fn test_reposition_and_restrict() {
        let style = ComponentStyle {
            levels: 1,
            precinct_exponents: vec![(4, 4)],
            ..ComponentStyle::default()
        };
        let info = ComponentInfo::default();
        let kernel = KernelDescription::new(KernelId::Reversible53);
        let mut res = Resolution::new(&spec(&style, &info, &kernel, Rect::new(0, 0, 32, 32))).unwrap();
        res.reposition(Rect::new(32, 0, 64, 20)).unwrap();
        let fresh = Resolution::new(&spec(&style, &info, &kernel, Rect::new(32, 0, 64, 20))).unwrap();
        assert_eq!(res.precinct_indices, fresh.precinct_indices);
        assert_eq!(res.subbands, fresh.subbands);

        res.restrict(&Rect::new(40, 0, 41, 1));
        assert_eq!(res.relevant_precincts, Rect::new(2, 0, 3, 1));
        res.restrict(&Rect::new(0, 0, 0, 0));
        assert!(res.relevant_precincts.is_empty());
        assert!(!res.is_relevant(Coords::new(2, 0)));
    }
}

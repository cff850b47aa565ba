//! Per-resolution decomposition trees.
//!
//! A resolution above the lowest one is produced by one primary split of its parent
//! image, whose non-LL children may be split again twice more (Part 2 arbitrary
//! decompositions). All nodes of one resolution live in a single arena owned by the
//! [`DecompositionTree`]; parents and children are arena indices.

use crate::error::J2kError;
use crate::jpeg2000::geometry::{Rect, merge_ranges, split_range};
use crate::jpeg2000::kernel::{Branch, KernelDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitKind {
    None,
    Horizontal,
    Vertical,
    Both,
}

impl SplitKind {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::None,
            1 => Self::Horizontal,
            2 => Self::Vertical,
            _ => Self::Both,
        }
    }

    pub fn splits_x(self) -> bool {
        matches!(self, Self::Horizontal | Self::Both)
    }

    pub fn splits_y(self) -> bool {
        matches!(self, Self::Vertical | Self::Both)
    }

    /// Child branches in creation order.
    pub fn children(self) -> &'static [(Branch, Branch)] {
        use Branch::*;
        match self {
            Self::None => &[],
            Self::Horizontal => &[(Low, Unsplit), (High, Unsplit)],
            Self::Vertical => &[(Unsplit, Low), (Unsplit, High)],
            Self::Both => &[(Low, Low), (High, Low), (Low, High), (High, High)],
        }
    }
}

/// Packed split selectors for one DWT level: bits 0-1 hold the primary split, bits 2-7
/// the secondary splits of the three non-LL primary children, bits 8-31 the tertiary
/// splits (four per secondary node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecompositionCode(pub u32);

impl DecompositionCode {
    pub const MALLAT: Self = Self(3);

    pub fn primary(self) -> SplitKind {
        SplitKind::from_bits(self.0)
    }

    pub fn secondary(self, child: usize) -> SplitKind {
        SplitKind::from_bits(self.0 >> (2 + 2 * child))
    }

    pub fn tertiary(self, child: usize, grandchild: usize) -> SplitKind {
        SplitKind::from_bits(self.0 >> (8 + 2 * (4 * child + grandchild)))
    }

    pub fn is_mallat(self) -> bool {
        self == Self::MALLAT
    }

    pub fn validate(self) -> Result<(), J2kError> {
        if self.primary() == SplitKind::None {
            return Err(J2kError::InconsistentDecomposition(format!(
                "code {:#x} has no primary split",
                self.0
            )));
        }
        Ok(())
    }
}

/// Branch sequence of one subband below its resolution's root, one entry per depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandDescriptor {
    pub x: Vec<Branch>,
    pub y: Vec<Branch>,
}

/// Enumerates the subbands a decomposition code produces, in codestream order.
pub fn subband_descriptor(code: DecompositionCode) -> Vec<BandDescriptor> {
    let mut out = Vec::new();
    let primary = code.primary();
    let mut k = 0;
    for &(px, py) in primary.children() {
        if px != Branch::High && py != Branch::High {
            continue;
        }
        let secondary = code.secondary(k);
        if secondary == SplitKind::None {
            out.push(BandDescriptor {
                x: vec![px],
                y: vec![py],
            });
        }
        for (j, &(sx, sy)) in secondary.children().iter().enumerate() {
            let tertiary = code.tertiary(k, j);
            if tertiary == SplitKind::None {
                out.push(BandDescriptor {
                    x: vec![px, sx],
                    y: vec![py, sy],
                });
            }
            for &(tx, ty) in tertiary.children() {
                out.push(BandDescriptor {
                    x: vec![px, sx, tx],
                    y: vec![py, sy, ty],
                });
            }
        }
        k += 1;
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Interior,
    Band(usize),
    /// The LL child of the primary split: the next lower resolution.
    NextResolution,
}

#[derive(Debug, Clone)]
pub struct DecompositionNode {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub branch_x: Branch,
    pub branch_y: Branch,
    pub split: SplitKind,
    pub rect: Rect,
    pub kind: NodeKind,
    /// Whole branch history from the full-resolution tile-component, finest first.
    pub path_x: Vec<Branch>,
    pub path_y: Vec<Branch>,
    pub energy_gain: f64,
    pub bibo_gain: f64,
}

impl DecompositionNode {
    /// Number of high-pass stages along the full path.
    pub fn high_pass_count(&self) -> u8 {
        self.path_x
            .iter()
            .chain(self.path_y.iter())
            .filter(|b| b.is_high())
            .count() as u8
    }
}

#[derive(Debug, Clone)]
pub struct DecompositionTree {
    pub nodes: Vec<DecompositionNode>,
    /// Node index of each subband, in subband order.
    pub bands: Vec<usize>,
    pub can_flip: bool,
}

impl DecompositionTree {
    /// The lowest resolution: a single LL band covering `rect`.
    pub fn lowest(
        rect: Rect,
        path_x: Vec<Branch>,
        path_y: Vec<Branch>,
        kernel: &KernelDescription,
    ) -> Self {
        let root = Self::node(None, Branch::Unsplit, Branch::Unsplit, rect, path_x, path_y, kernel);
        let mut tree = Self {
            nodes: vec![root],
            bands: vec![0],
            can_flip: kernel.is_symmetric(),
        };
        tree.nodes[0].kind = NodeKind::Band(0);
        tree
    }

    /// Builds the tree of a resolution covering `rect`, checking its subbands against
    /// `descriptor`.
    pub fn build(
        rect: Rect,
        code: DecompositionCode,
        root_path_x: Vec<Branch>,
        root_path_y: Vec<Branch>,
        kernel: &KernelDescription,
        descriptor: &[BandDescriptor],
    ) -> Result<Self, J2kError> {
        code.validate()?;
        let root = Self::node(
            None,
            Branch::Unsplit,
            Branch::Unsplit,
            rect,
            root_path_x,
            root_path_y,
            kernel,
        );
        let mut tree = Self {
            nodes: vec![root],
            bands: Vec::new(),
            can_flip: kernel.is_symmetric(),
        };

        let primary = code.primary();
        tree.nodes[0].split = primary;
        let mut k = 0;
        for &(bx, by) in primary.children() {
            let child = tree.add_child(0, bx, by, kernel);
            if bx != Branch::High && by != Branch::High {
                tree.nodes[child].kind = NodeKind::NextResolution;
                continue;
            }
            let secondary = code.secondary(k);
            tree.split_node(child, secondary, kernel, |j| code.tertiary(k, j));
            k += 1;
        }

        tree.check_against(descriptor)?;
        Ok(tree)
    }

    fn split_node(
        &mut self,
        node: usize,
        split: SplitKind,
        kernel: &KernelDescription,
        next_level: impl Fn(usize) -> SplitKind,
    ) {
        if split == SplitKind::None {
            self.make_band(node);
            return;
        }
        self.nodes[node].split = split;
        self.note_flip(node, split);
        for (j, &(bx, by)) in split.children().iter().enumerate() {
            let child = self.add_child(node, bx, by, kernel);
            let deeper = next_level(j);
            if deeper == SplitKind::None {
                self.make_band(child);
            } else {
                self.nodes[child].split = deeper;
                self.note_flip(child, deeper);
                for &(cx, cy) in deeper.children() {
                    let leaf = self.add_child(child, cx, cy, kernel);
                    self.make_band(leaf);
                }
            }
        }
    }

    // A high-pass branch split again along the same axis breaks flipping symmetry.
    fn note_flip(&mut self, node: usize, split: SplitKind) {
        let n = &self.nodes[node];
        if (n.branch_x.is_high() && split.splits_x()) || (n.branch_y.is_high() && split.splits_y())
        {
            self.can_flip = false;
        }
    }

    fn make_band(&mut self, node: usize) {
        self.nodes[node].kind = NodeKind::Band(self.bands.len());
        self.bands.push(node);
    }

    fn add_child(&mut self, parent: usize, bx: Branch, by: Branch, kernel: &KernelDescription) -> usize {
        let p = &self.nodes[parent];
        let axis = |lo: i64, hi: i64, b: Branch| match b {
            Branch::Unsplit => (lo, hi),
            _ => split_range(lo, hi, b.is_high()),
        };
        let (x0, x1) = axis(p.rect.x0, p.rect.x1, bx);
        let (y0, y1) = axis(p.rect.y0, p.rect.y1, by);
        let mut path_x = p.path_x.clone();
        let mut path_y = p.path_y.clone();
        path_x.push(bx);
        path_y.push(by);
        let node = Self::node(
            Some(parent),
            bx,
            by,
            Rect::new(x0, y0, x1, y1),
            path_x,
            path_y,
            kernel,
        );
        let idx = self.nodes.len();
        self.nodes.push(node);
        self.nodes[parent].children.push(idx);
        idx
    }

    fn node(
        parent: Option<usize>,
        branch_x: Branch,
        branch_y: Branch,
        rect: Rect,
        path_x: Vec<Branch>,
        path_y: Vec<Branch>,
        kernel: &KernelDescription,
    ) -> DecompositionNode {
        let energy_gain = kernel.energy_gain(&path_x) * kernel.energy_gain(&path_y);
        let bibo_gain = kernel.bibo_gain(&path_x) * kernel.bibo_gain(&path_y);
        DecompositionNode {
            parent,
            children: Vec::new(),
            branch_x,
            branch_y,
            split: SplitKind::None,
            rect,
            kind: NodeKind::Interior,
            path_x,
            path_y,
            energy_gain,
            bibo_gain,
        }
    }

    /// Branches of `node` below the root of this tree.
    pub fn local_descriptor(&self, node: usize) -> BandDescriptor {
        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut idx = node;
        while let Some(parent) = self.nodes[idx].parent {
            x.push(self.nodes[idx].branch_x);
            y.push(self.nodes[idx].branch_y);
            idx = parent;
        }
        x.reverse();
        y.reverse();
        BandDescriptor { x, y }
    }

    fn check_against(&self, descriptor: &[BandDescriptor]) -> Result<(), J2kError> {
        if descriptor.len() != self.bands.len() {
            return Err(J2kError::InconsistentDecomposition(format!(
                "tree has {} subbands, descriptor lists {}",
                self.bands.len(),
                descriptor.len()
            )));
        }
        for (b, (&node, expected)) in self.bands.iter().zip(descriptor).enumerate() {
            if &self.local_descriptor(node) != expected {
                return Err(J2kError::InconsistentDecomposition(format!(
                    "subband {b} created out of order"
                )));
            }
        }
        Ok(())
    }

    /// Region of the LL child, i.e. the next lower resolution.
    pub fn next_resolution_rect(&self) -> Option<Rect> {
        self.nodes
            .iter()
            .find(|n| n.kind == NodeKind::NextResolution)
            .map(|n| n.rect)
    }

    /// Moves the tree to a new root region. Children follow their branches; gains and
    /// structure are unchanged.
    pub fn reposition(&mut self, rect: Rect) {
        self.nodes[0].rect = rect;
        // Parents always precede their children.
        for idx in 1..self.nodes.len() {
            let Some(parent) = self.nodes[idx].parent else {
                continue;
            };
            let p = self.nodes[parent].rect;
            let axis = |lo: i64, hi: i64, b: Branch| match b {
                Branch::Unsplit => (lo, hi),
                _ => split_range(lo, hi, b.is_high()),
            };
            let n = &mut self.nodes[idx];
            let (x0, x1) = axis(p.x0, p.x1, n.branch_x);
            let (y0, y1) = axis(p.y0, p.y1, n.branch_y);
            n.rect = Rect::new(x0, y0, x1, y1);
        }
    }

    pub fn band_node(&self, band: usize) -> &DecompositionNode {
        &self.nodes[self.bands[band]]
    }

    /// Region of `node` recomputed from its children, if it has any.
    pub fn rect_from_children(&self, node: usize) -> Option<Rect> {
        let n = &self.nodes[node];
        let child = |i: usize| self.nodes.get(*n.children.get(i)?).map(|c| c.rect);
        let (x, y) = match n.split {
            SplitKind::None => return None,
            SplitKind::Horizontal => {
                let (lo, hi) = (child(0)?, child(1)?);
                (merge_ranges((lo.x0, lo.x1), (hi.x0, hi.x1)), (lo.y0, lo.y1))
            }
            SplitKind::Vertical => {
                let (lo, hi) = (child(0)?, child(1)?);
                ((lo.x0, lo.x1), merge_ranges((lo.y0, lo.y1), (hi.y0, hi.y1)))
            }
            SplitKind::Both => {
                let (ll, hl, lh) = (child(0)?, child(1)?, child(2)?);
                (
                    merge_ranges((ll.x0, ll.x1), (hl.x0, hl.x1)),
                    merge_ranges((ll.y0, ll.y1), (lh.y0, lh.y1)),
                )
            }
        };
        Some(Rect::new(x.0, y.0, x.1, y.1))
    }
}

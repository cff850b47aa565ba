use crate::error::J2kError;
use crate::jpeg2000::bit_io::{J2kBitReader, J2kBitWriter};

const UNKNOWN: i32 = i32::MAX;

/// Tag tree used by packet headers for code-block inclusion and missing MSBs.
///
/// Each interior node holds the minimum of its children. The encoder and the decoder keep
/// the same per-node `low` state, so coding a leaf against increasing thresholds across
/// layers only emits the bits not already implied by earlier calls.
#[derive(Clone, Debug)]
pub struct TagTree {
    nodes: Vec<TagTreeNode>,
    leaf_width: usize,
    leaf_height: usize,
}

#[derive(Clone, Debug)]
struct TagTreeNode {
    value: i32,
    low: i32,
    known: bool,
    parent_index: Option<usize>,
}

impl Default for TagTreeNode {
    fn default() -> Self {
        Self {
            value: UNKNOWN,
            low: 0,
            known: false,
            parent_index: None,
        }
    }
}

impl TagTree {
    /// Create a new TagTree for a grid of `w` x `h` leaves.
    pub fn new(w: usize, h: usize) -> Self {
        let mut nodes = Vec::new();
        if w == 0 || h == 0 {
            return Self {
                nodes,
                leaf_width: 0,
                leaf_height: 0,
            };
        }

        let mut current_level_start = 0;
        let mut current_w = w;
        let mut current_h = h;
        nodes.resize(w * h, TagTreeNode::default());

        while current_w > 1 || current_h > 1 {
            let next_w = current_w.div_ceil(2);
            let next_h = current_h.div_ceil(2);
            let next_level_start = nodes.len();
            nodes.resize(next_level_start + next_w * next_h, TagTreeNode::default());

            for y in 0..current_h {
                for x in 0..current_w {
                    let child_idx = current_level_start + y * current_w + x;
                    let parent_idx = next_level_start + (y / 2) * next_w + x / 2;
                    nodes[child_idx].parent_index = Some(parent_idx);
                }
            }

            current_w = next_w;
            current_h = next_h;
            current_level_start = next_level_start;
        }

        Self {
            nodes,
            leaf_width: w,
            leaf_height: h,
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_width * self.leaf_height
    }

    /// Forget all values and coding state.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.value = UNKNOWN;
            node.low = 0;
            node.known = false;
        }
    }

    fn leaf(&self, x: usize, y: usize) -> Option<usize> {
        (x < self.leaf_width && y < self.leaf_height).then(|| y * self.leaf_width + x)
    }

    /// Set the value at a leaf, lowering ancestors that hold a larger value.
    pub fn set_value(&mut self, x: usize, y: usize, value: i32) {
        let Some(mut idx) = self.leaf(x, y) else {
            return;
        };
        self.nodes[idx].value = value;
        while let Some(parent) = self.nodes[idx].parent_index {
            if self.nodes[parent].value <= value {
                break;
            }
            self.nodes[parent].value = value;
            idx = parent;
        }
    }

    /// Rebuilds interior minima after leaves were raised as well as lowered.
    pub fn rebuild(&mut self) {
        let leaves = self.leaf_count();
        for node in &mut self.nodes[leaves..] {
            node.value = UNKNOWN;
        }
        for idx in 0..self.nodes.len() {
            if let Some(parent) = self.nodes[idx].parent_index {
                let v = self.nodes[idx].value;
                if v < self.nodes[parent].value {
                    self.nodes[parent].value = v;
                }
            }
        }
    }

    /// Leaf value if it has been fully decoded or explicitly set.
    pub fn value(&self, x: usize, y: usize) -> Option<i32> {
        let idx = self.leaf(x, y)?;
        let v = self.nodes[idx].value;
        (v != UNKNOWN).then_some(v)
    }

    fn path(&self, leaf_idx: usize) -> Vec<usize> {
        let mut stack = vec![leaf_idx];
        let mut idx = leaf_idx;
        while let Some(parent) = self.nodes[idx].parent_index {
            stack.push(parent);
            idx = parent;
        }
        stack
    }

    /// Encodes the leaf at (x, y) up to `threshold`: afterwards the decoder knows whether
    /// the leaf value is below the threshold, and its exact value if it is.
    pub fn encode(&mut self, writer: &mut J2kBitWriter, x: usize, y: usize, threshold: i32) {
        let Some(leaf_idx) = self.leaf(x, y) else {
            return;
        };
        let mut stack = self.path(leaf_idx);
        let mut low = 0;
        while let Some(curr_idx) = stack.pop() {
            let node = &mut self.nodes[curr_idx];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold {
                if low >= node.value {
                    if !node.known {
                        writer.write_bit(1);
                        node.known = true;
                    }
                    break;
                }
                writer.write_bit(0);
                low += 1;
            }
            node.low = low;
        }
    }

    /// Decodes the leaf at (x, y) up to `threshold`. Returns true when the leaf value is
    /// known to be below the threshold.
    pub fn decode(
        &mut self,
        reader: &mut J2kBitReader,
        x: usize,
        y: usize,
        threshold: i32,
    ) -> Result<bool, J2kError> {
        let Some(leaf_idx) = self.leaf(x, y) else {
            return Ok(false);
        };
        let mut stack = self.path(leaf_idx);
        let mut low = 0;
        while let Some(curr_idx) = stack.pop() {
            let node = &mut self.nodes[curr_idx];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold && low < node.value {
                if reader.read_bit()? == 1 {
                    node.value = low;
                } else {
                    low += 1;
                }
            }
            node.low = low;
        }
        Ok(self.nodes[leaf_idx].value < threshold)
    }
}

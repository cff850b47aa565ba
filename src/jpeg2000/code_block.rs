//! Code-block data exchanged with the external block coder.

use crate::constants::MAXIMUM_MAGNITUDE_BITS;
use crate::error::J2kError;
use crate::jpeg2000::geometry::{Coords, Rect};

/// Converts a distortion-length slope into the 16-bit logarithmic scale used for
/// thresholds. Zero is reserved for "not a truncation point".
pub fn slope_to_u16(lambda: f64) -> u16 {
    if lambda.is_infinite() && lambda > 0.0 {
        return u16::MAX;
    }
    if !(lambda > 0.0) {
        return 1;
    }
    (256.0 * lambda.log2() + 32768.0).round().clamp(1.0, 65535.0) as u16
}

pub fn slope_from_u16(slope: u16) -> f64 {
    2f64.powf((slope as f64 - 32768.0) / 256.0)
}

/// Coded output of one code-block as produced by the block coder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockEncoding {
    pub bytes: Vec<u8>,
    /// Cumulative codeword length after each coding pass.
    pub pass_lengths: Vec<u32>,
    /// Log-domain slope of each pass; 0 marks passes that are not truncation points.
    pub slopes: Vec<u16>,
    /// Most significant bit-planes that are entirely zero.
    pub missing_msbs: u8,
}

impl BlockEncoding {
    pub fn new(
        bytes: Vec<u8>,
        pass_lengths: Vec<u32>,
        slopes: Vec<u16>,
        missing_msbs: u8,
    ) -> Result<Self, J2kError> {
        let enc = Self {
            bytes,
            pass_lengths,
            slopes,
            missing_msbs,
        };
        enc.validate()?;
        Ok(enc)
    }

    /// Builds slopes from per-pass distortion reductions, keeping only the passes on the
    /// convex hull of the rate-distortion curve. `weight` scales distortions into the
    /// image domain.
    pub fn from_distortions(
        bytes: Vec<u8>,
        pass_lengths: Vec<u32>,
        distortion_reductions: &[f64],
        weight: f64,
        missing_msbs: u8,
    ) -> Result<Self, J2kError> {
        if distortion_reductions.len() != pass_lengths.len() {
            return Err(J2kError::invalid(
                "distortion_reductions",
                "one entry per coding pass required",
            ));
        }
        let n = pass_lengths.len();
        let mut rate = Vec::with_capacity(n + 1);
        let mut dist = Vec::with_capacity(n + 1);
        rate.push(0.0f64);
        dist.push(0.0f64);
        for p in 0..n {
            rate.push(pass_lengths[p] as f64);
            dist.push(dist[p] + distortion_reductions[p] * weight);
        }

        // Indices of truncation points on the hull, starting at the empty point.
        let mut hull: Vec<usize> = vec![0];
        let slope = |a: usize, b: usize| {
            let dr = rate[b] - rate[a];
            let dd = dist[b] - dist[a];
            if dr <= 0.0 {
                if dd > 0.0 { f64::INFINITY } else { -1.0 }
            } else {
                dd / dr
            }
        };
        for p in 1..=n {
            if dist[p] <= dist[*hull.last().unwrap_or(&0)] {
                continue;
            }
            while hull.len() >= 2 {
                let last = hull[hull.len() - 1];
                let prev = hull[hull.len() - 2];
                if slope(last, p) >= slope(prev, last) {
                    hull.pop();
                } else {
                    break;
                }
            }
            hull.push(p);
        }

        let mut slopes = vec![0u16; n];
        let mut previous = u16::MAX;
        for w in hull.windows(2) {
            let s = slope_to_u16(slope(w[0], w[1])).min(previous).max(1);
            slopes[w[1] - 1] = s;
            previous = s;
        }
        Self::new(bytes, pass_lengths, slopes, missing_msbs)
    }

    pub fn validate(&self) -> Result<(), J2kError> {
        if self.slopes.len() != self.pass_lengths.len() {
            return Err(J2kError::invalid("slopes", "one slope per coding pass required"));
        }
        if self.pass_lengths.windows(2).any(|w| w[1] < w[0]) {
            return Err(J2kError::invalid("pass_lengths", "must be cumulative"));
        }
        if self.pass_lengths.last().copied().unwrap_or(0) as usize > self.bytes.len() {
            return Err(J2kError::invalid("pass_lengths", "exceed the codeword length"));
        }
        let mut last = u16::MAX;
        for &s in self.slopes.iter().filter(|&&s| s != 0) {
            if s > last {
                return Err(J2kError::invalid("slopes", "truncation slopes must not increase"));
            }
            last = s;
        }
        if self.missing_msbs > 2 * MAXIMUM_MAGNITUDE_BITS {
            return Err(J2kError::invalid("missing_msbs", "out of range"));
        }
        Ok(())
    }

    pub fn num_passes(&self) -> u16 {
        self.pass_lengths.len() as u16
    }

    /// Codeword bytes needed to carry the first `passes` passes.
    pub fn length_at(&self, passes: u16) -> u32 {
        if passes == 0 {
            0
        } else {
            self.pass_lengths[passes as usize - 1]
        }
    }

    pub fn is_truncation_point(&self, passes: u16) -> bool {
        passes == 0 || self.slopes.get(passes as usize - 1).is_some_and(|&s| s != 0)
    }

    /// Largest truncation point whose slope reaches `threshold`, never below `at_least`
    /// and never above `limit` passes.
    pub fn passes_for_threshold(&self, threshold: u16, at_least: u16, limit: u16) -> u16 {
        let limit = limit.min(self.num_passes());
        let mut best = at_least;
        for p in (at_least + 1)..=limit {
            let s = self.slopes[p as usize - 1];
            if s == 0 {
                continue;
            }
            if s < threshold {
                break;
            }
            best = p;
        }
        best
    }

    /// Previous truncation point strictly below `passes`, not going under `floor`.
    pub fn previous_truncation_point(&self, passes: u16, floor: u16) -> u16 {
        let mut p = passes;
        while p > floor {
            p -= 1;
            if p == floor || self.is_truncation_point(p) {
                return p;
            }
        }
        floor
    }
}

/// Data recovered for one code-block from the packets parsed so far.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceivedBlock {
    pub bytes: Vec<u8>,
    pub passes: u16,
    pub missing_msbs: u8,
    /// Number of layers that contributed data.
    pub layers: u16,
}

/// Per-block state held inside a precinct.
#[derive(Debug, Clone, Default)]
pub struct CodeBlock {
    pub index: Coords,
    pub rect: Rect,
    pub encoding: Option<BlockEncoding>,
    pub received: ReceivedBlock,
    /// Cumulative passes included after each finalized layer.
    pub layer_passes: Vec<u16>,
    /// Filler bytes appended to this block's contribution in each layer.
    pub filler: Vec<u32>,
}

impl CodeBlock {
    pub fn reset(&mut self, index: Coords, rect: Rect) {
        self.index = index;
        self.rect = rect;
        self.encoding = None;
        self.received.bytes.clear();
        self.received.passes = 0;
        self.received.missing_msbs = 0;
        self.received.layers = 0;
        self.layer_passes.clear();
        self.filler.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.rect.is_empty()
    }

    /// Passes committed before `layer`.
    pub fn passes_before(&self, layer: u16) -> u16 {
        if layer == 0 {
            0
        } else {
            self.layer_passes
                .get(layer as usize - 1)
                .copied()
                .unwrap_or(0)
        }
    }

    pub fn footprint(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.encoding.as_ref().map_or(0, |e| {
                e.bytes.capacity() + 6 * e.pass_lengths.capacity()
            })
            + self.received.bytes.capacity()
            + 6 * self.layer_passes.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slope_scale_is_monotonic() {
        assert!(slope_to_u16(2.0) > slope_to_u16(1.0));
        assert_eq!(slope_to_u16(1.0), 32768);
        assert_eq!(slope_to_u16(f64::INFINITY), u16::MAX);
        assert!((slope_from_u16(slope_to_u16(8.0)) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_hull_drops_non_convex_passes() {
        // Pass 2 gives little for its cost, pass 3 recovers: pass 2 is not on the hull.
        let enc = BlockEncoding::from_distortions(
            vec![0; 40],
            vec![10, 20, 30, 40],
            &[100.0, 1.0, 99.0, 10.0],
            1.0,
            2,
        )
        .unwrap();
        assert!(enc.slopes[0] != 0);
        assert_eq!(enc.slopes[1], 0);
        assert!(enc.slopes[2] != 0);
        assert!(enc.slopes[0] >= enc.slopes[2] && enc.slopes[2] >= enc.slopes[3]);
    }

    #[test]
    fn test_threshold_selection() {
        let enc = BlockEncoding::new(
            vec![0; 30],
            vec![5, 10, 18, 30],
            vec![40000, 0, 35000, 30000],
            0,
        )
        .unwrap();
        assert_eq!(enc.passes_for_threshold(36000, 0, 100), 1);
        assert_eq!(enc.passes_for_threshold(35000, 0, 100), 3);
        assert_eq!(enc.passes_for_threshold(0, 0, 100), 4);
        assert_eq!(enc.passes_for_threshold(0, 0, 2), 1);
        assert_eq!(enc.passes_for_threshold(50000, 1, 100), 1);
        assert_eq!(enc.previous_truncation_point(3, 0), 1);
        assert_eq!(enc.previous_truncation_point(1, 0), 0);
        assert_eq!(enc.length_at(3), 18);
    }

    #[test]
    fn test_invalid_encodings() {
        assert!(BlockEncoding::new(vec![0; 4], vec![5], vec![1], 0).is_err());
        assert!(BlockEncoding::new(vec![0; 9], vec![5, 4], vec![2, 1], 0).is_err());
        assert!(BlockEncoding::new(vec![0; 9], vec![4, 8], vec![1, 2], 0).is_err());
    }
}

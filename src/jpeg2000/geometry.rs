//! Integer geometry on the canvas and on the derived resolution/subband grids.

use crate::error::J2kError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Coords {
    pub x: i64,
    pub y: i64,
}

impl Coords {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    pub fn transpose(self) -> Self {
        Self {
            x: self.y,
            y: self.x,
        }
    }
}

/// Half-open rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x0: i64,
    pub y0: i64,
    pub x1: i64,
    pub y1: i64,
}

impl Rect {
    pub const fn new(x0: i64, y0: i64, x1: i64, y1: i64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn from_origin_size(origin: Coords, size: Coords) -> Self {
        Self {
            x0: origin.x,
            y0: origin.y,
            x1: origin.x + size.x,
            y1: origin.y + size.y,
        }
    }

    pub fn width(&self) -> i64 {
        (self.x1 - self.x0).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.y1 - self.y0).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    pub fn origin(&self) -> Coords {
        Coords::new(self.x0, self.y0)
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let r = Rect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        };
        if r.is_empty() {
            Rect {
                x0: r.x0,
                y0: r.y0,
                x1: r.x0.max(r.x1),
                y1: r.y0.max(r.y1),
            }
        } else {
            r
        }
    }

    pub fn contains(&self, p: Coords) -> bool {
        p.x >= self.x0 && p.x < self.x1 && p.y >= self.y0 && p.y < self.y1
    }

    /// Maps the rectangle onto a grid sub-sampled by `sub` (ceiling division of both edges).
    pub fn subsample(&self, sub: Coords) -> Rect {
        Rect {
            x0: ceil_div(self.x0, sub.x),
            y0: ceil_div(self.y0, sub.y),
            x1: ceil_div(self.x1, sub.x),
            y1: ceil_div(self.y1, sub.y),
        }
    }

    /// Linear raster index of `p` relative to this rectangle.
    pub fn raster_index(&self, p: Coords) -> usize {
        ((p.y - self.y0) * self.width() + (p.x - self.x0)) as usize
    }

    /// Inverse of [`Rect::raster_index`].
    pub fn position_of(&self, index: usize) -> Coords {
        let w = self.width().max(1);
        Coords::new(self.x0 + index as i64 % w, self.y0 + index as i64 / w)
    }
}

pub fn ceil_div(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    -((-a).div_euclid(b))
}

pub fn floor_div(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    a.div_euclid(b)
}

pub fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.abs()
}

/// Range of one branch of a two-channel split: `[ceil((x0 - b)/2), ceil((x1 - b)/2))`.
pub fn split_range(x0: i64, x1: i64, high: bool) -> (i64, i64) {
    let b = high as i64;
    (ceil_div(x0 - b, 2), ceil_div(x1 - b, 2))
}

/// Recovers the parent range of a split from its low and high branch ranges.
pub fn merge_ranges(low: (i64, i64), high: (i64, i64)) -> (i64, i64) {
    let x0 = (2 * low.0).min(2 * high.0 + 1);
    let x1 = (2 * low.1).min(2 * high.1 + 1);
    (x0, x1)
}

/// A regular partition of the plane into cells of power-of-two size anchored at an origin
/// whose coordinates are 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    pub origin: Coords,
    pub size: Coords,
}

impl Partition {
    pub fn new(what: &'static str, origin: Coords, size: Coords) -> Result<Self, J2kError> {
        let p = Self { origin, size };
        p.check(what)?;
        Ok(p)
    }

    pub fn check(&self, what: &'static str) -> Result<(), J2kError> {
        let valid_size = |s: i64| s > 0 && (s & (s - 1)) == 0;
        let valid_origin = |o: i64| o == 0 || o == 1;
        if !valid_size(self.size.x)
            || !valid_size(self.size.y)
            || !valid_origin(self.origin.x)
            || !valid_origin(self.origin.y)
        {
            return Err(J2kError::InvalidPartition {
                what,
                width: self.size.x,
                height: self.size.y,
                origin_x: self.origin.x,
                origin_y: self.origin.y,
            });
        }
        Ok(())
    }

    pub fn size_exponents(&self) -> (u8, u8) {
        (
            self.size.x.trailing_zeros() as u8,
            self.size.y.trailing_zeros() as u8,
        )
    }

    /// Index range of the cells intersecting `region`; empty when the region is empty.
    pub fn indices(&self, region: &Rect) -> Rect {
        if region.is_empty() {
            return Rect::new(0, 0, 0, 0);
        }
        Rect {
            x0: floor_div(region.x0 - self.origin.x, self.size.x),
            y0: floor_div(region.y0 - self.origin.y, self.size.y),
            x1: ceil_div(region.x1 - self.origin.x, self.size.x),
            y1: ceil_div(region.y1 - self.origin.y, self.size.y),
        }
    }

    /// Unclipped cell with index `idx`.
    pub fn cell(&self, idx: Coords) -> Rect {
        Rect {
            x0: self.origin.x + idx.x * self.size.x,
            y0: self.origin.y + idx.y * self.size.y,
            x1: self.origin.x + (idx.x + 1) * self.size.x,
            y1: self.origin.y + (idx.y + 1) * self.size.y,
        }
    }

    /// Index of the cell containing `p`.
    pub fn cell_of(&self, p: Coords) -> Coords {
        Coords::new(
            floor_div(p.x - self.origin.x, self.size.x),
            floor_div(p.y - self.origin.y, self.size.y),
        )
    }

    /// The partition induced on one branch of a split of each axis.
    /// `split` selects which axes are split; `high` selects the branch on split axes.
    pub fn descend(&self, split_x: bool, high_x: bool, split_y: bool, high_y: bool) -> Option<Self> {
        let axis = |o: i64, s: i64, split: bool, high: bool| -> Option<(i64, i64)> {
            if !split {
                return Some((o, s));
            }
            if s < 2 {
                return None;
            }
            Some((ceil_div(o - high as i64, 2), s / 2))
        };
        let (ox, sx) = axis(self.origin.x, self.size.x, split_x, high_x)?;
        let (oy, sy) = axis(self.origin.y, self.size.y, split_y, high_y)?;
        Some(Self {
            origin: Coords::new(ox, oy),
            size: Coords::new(sx, sy),
        })
    }
}

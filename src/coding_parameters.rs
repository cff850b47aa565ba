//! Coding parameters for one codestream.
//!
//! [`CodingParams`] is a plain struct of public fields with sensible defaults. Call
//! [`CodingParams::validate`] (the codestream does so on creation) before deriving any
//! structure from it.

use crate::constants::{
    MAXIMUM_BLOCK_AREA_EXPONENT, MAXIMUM_BLOCK_EXPONENT, MAXIMUM_COMPONENTS, MAXIMUM_DWT_LEVELS,
    MAXIMUM_PRECINCT_EXPONENT, MAXIMUM_TILES, MINIMUM_BLOCK_EXPONENT,
};
use crate::error::J2kError;
use crate::jpeg2000::decomposition::DecompositionCode;
use crate::jpeg2000::geometry::{Coords, Rect, ceil_div};
use crate::jpeg2000::kernel::KernelId;
use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::collections::BTreeMap;

/// Packet progression order, numbered as in the COD segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProgressionOrder {
    #[default]
    Lrcp = 0,
    Rlcp = 1,
    Rpcl = 2,
    Pcrl = 3,
    Cprl = 4,
}

impl ProgressionOrder {
    /// True when all layers of a precinct are visited consecutively.
    pub fn layer_innermost(self) -> bool {
        matches!(self, Self::Rpcl | Self::Pcrl | Self::Cprl)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Lrcp => "LRCP",
            Self::Rlcp => "RLCP",
            Self::Rpcl => "RPCL",
            Self::Pcrl => "PCRL",
            Self::Cprl => "CPRL",
        }
    }
}

bitflags! {
    /// Changes of these sequencer indices force a new tile-part.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TilePartDivision: u8 {
        const RESOLUTION = 0x01;
        const COMPONENT = 0x02;
        const LAYER = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentInfo {
    /// Bit depth, 1..=38.
    pub precision: u8,
    pub signed: bool,
    pub sub_x: u8,
    pub sub_y: u8,
}

impl Default for ComponentInfo {
    fn default() -> Self {
        Self {
            precision: 8,
            signed: false,
            sub_x: 1,
            sub_y: 1,
        }
    }
}

/// Per-component coding style (COD/COC and QCD/QCC content plus encoder-side weights).
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentStyle {
    pub levels: u8,
    pub kernel: KernelId,
    pub reversible: bool,
    /// Synthesis taps (low, high) when `kernel` is [`KernelId::Custom`].
    pub custom_taps: Option<(Vec<f64>, Vec<f64>)>,
    /// One code per DWT level, finest level first. Missing entries repeat the last one;
    /// an empty list means the Mallat decomposition.
    pub decomposition_codes: Vec<u32>,
    pub block_width_exponent: u8,
    pub block_height_exponent: u8,
    /// Precinct size exponents per resolution, lowest resolution first. Missing entries
    /// repeat the last one; an empty list means the maximum size.
    pub precinct_exponents: Vec<(u8, u8)>,
    pub guard_bits: u8,
    pub base_step: f32,
    /// Per-resolution visual weights, lowest resolution first; missing entries are 1.
    pub visual_weights: Vec<f32>,
    pub roi_shift: u8,
    pub roi_weight: f32,
    /// Step size below which coding passes are not worth keeping.
    pub quality_limit_step: Option<f32>,
}

impl Default for ComponentStyle {
    fn default() -> Self {
        Self {
            levels: 5,
            kernel: KernelId::Reversible53,
            reversible: true,
            custom_taps: None,
            decomposition_codes: Vec::new(),
            block_width_exponent: 6,
            block_height_exponent: 6,
            precinct_exponents: Vec::new(),
            guard_bits: 2,
            base_step: 1.0 / 128.0,
            visual_weights: Vec::new(),
            roi_shift: 0,
            roi_weight: 1.0,
            quality_limit_step: None,
        }
    }
}

impl ComponentStyle {
    pub fn num_resolutions(&self) -> usize {
        self.levels as usize + 1
    }

    /// Decomposition code for DWT level `level` (1 = finest).
    pub fn decomposition_code(&self, level: u8) -> DecompositionCode {
        if self.decomposition_codes.is_empty() || level == 0 {
            return DecompositionCode::MALLAT;
        }
        let idx = (level as usize - 1).min(self.decomposition_codes.len() - 1);
        DecompositionCode(self.decomposition_codes[idx])
    }

    pub fn precinct_exponents_for(&self, resolution: usize) -> (u8, u8) {
        match self.precinct_exponents.get(resolution) {
            Some(&p) => p,
            None => self
                .precinct_exponents
                .last()
                .copied()
                .unwrap_or((MAXIMUM_PRECINCT_EXPONENT, MAXIMUM_PRECINCT_EXPONENT)),
        }
    }

    pub fn visual_weight(&self, resolution: usize) -> f32 {
        self.visual_weights.get(resolution).copied().unwrap_or(1.0)
    }

    pub fn is_mallat(&self) -> bool {
        (1..=self.levels).all(|l| self.decomposition_code(l).is_mallat())
    }

    pub fn validate(&self) -> Result<(), J2kError> {
        if self.levels > MAXIMUM_DWT_LEVELS {
            return Err(J2kError::invalid("levels", format!("{} exceeds 32", self.levels)));
        }
        let (xcb, ycb) = (self.block_width_exponent, self.block_height_exponent);
        if !(MINIMUM_BLOCK_EXPONENT..=MAXIMUM_BLOCK_EXPONENT).contains(&xcb)
            || !(MINIMUM_BLOCK_EXPONENT..=MAXIMUM_BLOCK_EXPONENT).contains(&ycb)
            || xcb + ycb > MAXIMUM_BLOCK_AREA_EXPONENT
        {
            return Err(J2kError::InvalidPartition {
                what: "code-block",
                width: 1i64 << xcb.min(30),
                height: 1i64 << ycb.min(30),
                origin_x: 0,
                origin_y: 0,
            });
        }
        for (r, &(px, py)) in self.precinct_exponents.iter().enumerate() {
            if px > MAXIMUM_PRECINCT_EXPONENT || py > MAXIMUM_PRECINCT_EXPONENT {
                return Err(J2kError::invalid(
                    "precinct_exponents",
                    format!("resolution {r}: exponent above 15"),
                ));
            }
            if r > 0 && (px == 0 || py == 0) {
                return Err(J2kError::InvalidPartition {
                    what: "precinct",
                    width: 1 << px,
                    height: 1 << py,
                    origin_x: 0,
                    origin_y: 0,
                });
            }
        }
        if self.guard_bits > 7 {
            return Err(J2kError::invalid("guard_bits", "at most 7 guard bits"));
        }
        if !self.reversible && !(self.base_step > 0.0 && self.base_step.is_finite()) {
            return Err(J2kError::invalid("base_step", "must be positive"));
        }
        if self.kernel == KernelId::Reversible53 && !self.reversible {
            return Err(J2kError::UnsupportedCodingStyle(
                "5/3 kernel used irreversibly".into(),
            ));
        }
        if self.kernel == KernelId::Irreversible97 && self.reversible {
            return Err(J2kError::UnsupportedCodingStyle(
                "9/7 kernel cannot be reversible".into(),
            ));
        }
        if self.kernel == KernelId::Custom && self.custom_taps.is_none() {
            return Err(J2kError::MissingParameter("custom_taps"));
        }
        for (i, &code) in self.decomposition_codes.iter().enumerate() {
            DecompositionCode(code).validate().map_err(|_| {
                J2kError::invalid(
                    "decomposition_codes",
                    format!("level {}: code {code:#x} has no primary split", i + 1),
                )
            })?;
        }
        Ok(())
    }
}

/// Per-tile coding overrides. A tile carrying any override is never typical.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TileOverride {
    pub style: Option<ComponentStyle>,
    pub progression: Option<ProgressionOrder>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateParams {
    /// Fraction of a layer target by which the threshold search may undershoot.
    pub tolerance: f64,
    /// Allow trimming individual passes on the final search step.
    pub trim_to_limit: bool,
    pub min_slope_threshold: u16,
    /// Exact byte count to produce per flush (constant bit-rate mode).
    pub cbr_bytes: Option<u64>,
    /// Thresholds used when no byte targets are set, one per layer.
    pub layer_thresholds: Vec<u16>,
}

impl Default for RateParams {
    fn default() -> Self {
        Self {
            tolerance: 0.0,
            trim_to_limit: true,
            min_slope_threshold: 0,
            cbr_bytes: None,
            layer_thresholds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodingParams {
    pub image_x0: u32,
    pub image_y0: u32,
    pub image_x1: u32,
    pub image_y1: u32,
    pub tile_x0: u32,
    pub tile_y0: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub components: Vec<ComponentInfo>,
    pub style: ComponentStyle,
    pub component_styles: BTreeMap<u16, ComponentStyle>,
    pub tile_overrides: BTreeMap<u32, TileOverride>,
    pub num_layers: u16,
    pub progression: ProgressionOrder,
    pub mct: bool,
    /// Anchor of all precinct and code-block partitions; each coordinate is 0 or 1.
    pub partition_origin: Coords,
    pub tile_part_division: TilePartDivision,
    /// How many times a tile-part may be closed early because a precinct is not ready.
    pub max_interruptions: u32,
    pub use_sop: bool,
    pub use_eph: bool,
    pub write_plt: bool,
    pub resilient: bool,
    /// Keep tiles and precinct locations after they have been consumed.
    pub persistent: bool,
    /// Bytes of inactive precinct storage kept before eviction starts.
    pub precinct_memory_budget: usize,
    pub rate: RateParams,
}

impl Default for CodingParams {
    fn default() -> Self {
        Self {
            image_x0: 0,
            image_y0: 0,
            image_x1: 0,
            image_y1: 0,
            tile_x0: 0,
            tile_y0: 0,
            tile_width: 0,
            tile_height: 0,
            components: Vec::new(),
            style: ComponentStyle::default(),
            component_styles: BTreeMap::new(),
            tile_overrides: BTreeMap::new(),
            num_layers: 1,
            progression: ProgressionOrder::Lrcp,
            mct: false,
            partition_origin: Coords::new(0, 0),
            tile_part_division: TilePartDivision::empty(),
            max_interruptions: 0,
            use_sop: false,
            use_eph: false,
            write_plt: false,
            resilient: false,
            persistent: false,
            precinct_memory_budget: 1 << 24,
            rate: RateParams::default(),
        }
    }
}

impl CodingParams {
    /// Single-tile parameters for an image of `width` x `height` with `num_components`
    /// unsigned 8-bit components.
    pub fn new(width: u32, height: u32, num_components: u16) -> Self {
        Self {
            image_x1: width,
            image_y1: height,
            tile_width: width,
            tile_height: height,
            components: vec![ComponentInfo::default(); num_components as usize],
            ..Self::default()
        }
    }

    pub fn image_rect(&self) -> Rect {
        Rect::new(
            self.image_x0 as i64,
            self.image_y0 as i64,
            self.image_x1 as i64,
            self.image_y1 as i64,
        )
    }

    /// Tiles across and down.
    pub fn tile_grid(&self) -> (u32, u32) {
        let across = ceil_div(
            self.image_x1 as i64 - self.tile_x0 as i64,
            self.tile_width.max(1) as i64,
        );
        let down = ceil_div(
            self.image_y1 as i64 - self.tile_y0 as i64,
            self.tile_height.max(1) as i64,
        );
        (across.max(0) as u32, down.max(0) as u32)
    }

    pub fn num_tiles(&self) -> u32 {
        let (across, down) = self.tile_grid();
        across.saturating_mul(down)
    }

    pub fn tile_coords(&self, tile: u32) -> Coords {
        let (across, _) = self.tile_grid();
        let across = across.max(1);
        Coords::new((tile % across) as i64, (tile / across) as i64)
    }

    /// Canvas region of tile `tile`, clipped to the image.
    pub fn tile_rect(&self, tile: u32) -> Result<Rect, J2kError> {
        if tile >= self.num_tiles() {
            return Err(J2kError::NoSuchTile { tile });
        }
        let idx = self.tile_coords(tile);
        let cell = Rect::new(
            self.tile_x0 as i64 + idx.x * self.tile_width as i64,
            self.tile_y0 as i64 + idx.y * self.tile_height as i64,
            self.tile_x0 as i64 + (idx.x + 1) * self.tile_width as i64,
            self.tile_y0 as i64 + (idx.y + 1) * self.tile_height as i64,
        );
        Ok(cell.intersect(&self.image_rect()))
    }

    pub fn component_style(&self, tile: u32, component: usize) -> &ComponentStyle {
        if let Some(style) = self.tile_overrides.get(&tile).and_then(|o| o.style.as_ref()) {
            return style;
        }
        self.component_styles
            .get(&(component as u16))
            .unwrap_or(&self.style)
    }

    pub fn progression_for(&self, tile: u32) -> ProgressionOrder {
        self.tile_overrides
            .get(&tile)
            .and_then(|o| o.progression)
            .unwrap_or(self.progression)
    }

    /// A typical tile shares every coding parameter with the codestream defaults.
    pub fn is_typical(&self, tile: u32) -> bool {
        !self.tile_overrides.contains_key(&tile)
    }

    pub fn is_mallat(&self) -> bool {
        self.style.is_mallat()
            && self.component_styles.values().all(|s| s.is_mallat())
            && self
                .tile_overrides
                .values()
                .filter_map(|o| o.style.as_ref())
                .all(|s| s.is_mallat())
    }

    pub fn validate(&self) -> Result<(), J2kError> {
        if self.image_x1 <= self.image_x0 || self.image_y1 <= self.image_y0 {
            return Err(J2kError::MissingParameter("image size"));
        }
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(J2kError::MissingParameter("tile size"));
        }
        if self.tile_x0 > self.image_x0 || self.tile_y0 > self.image_y0 {
            return Err(J2kError::invalid("tile origin", "must not exceed the image origin"));
        }
        if self.tile_x0 as u64 + self.tile_width as u64 <= self.image_x0 as u64
            || self.tile_y0 as u64 + self.tile_height as u64 <= self.image_y0 as u64
        {
            return Err(J2kError::invalid("tile origin", "first tile misses the image"));
        }
        if self.num_tiles() > MAXIMUM_TILES {
            return Err(J2kError::invalid(
                "tile size",
                format!("{} tiles exceed 65535", self.num_tiles()),
            ));
        }
        if self.components.is_empty() {
            return Err(J2kError::MissingParameter("components"));
        }
        if self.components.len() > MAXIMUM_COMPONENTS as usize {
            return Err(J2kError::invalid("components", "more than 16384"));
        }
        for (c, info) in self.components.iter().enumerate() {
            if info.precision == 0 || info.precision > 38 {
                return Err(J2kError::invalid(
                    "precision",
                    format!("component {c}: {}", info.precision),
                ));
            }
            if info.sub_x == 0 || info.sub_y == 0 {
                return Err(J2kError::invalid(
                    "sub_sampling",
                    format!("component {c}: zero factor"),
                ));
            }
        }
        if self.num_layers == 0 {
            return Err(J2kError::MissingParameter("num_layers"));
        }
        if self.mct && self.components.len() < 3 {
            return Err(J2kError::invalid("mct", "needs at least three components"));
        }
        let o = self.partition_origin;
        if !(0..=1).contains(&o.x) || !(0..=1).contains(&o.y) {
            return Err(J2kError::InvalidPartition {
                what: "partition origin",
                width: 0,
                height: 0,
                origin_x: o.x,
                origin_y: o.y,
            });
        }
        if !(0.0..1.0).contains(&self.rate.tolerance) {
            return Err(J2kError::invalid("tolerance", "must lie in [0, 1)"));
        }
        self.style.validate()?;
        for style in self.component_styles.values() {
            style.validate()?;
        }
        for (&tile, ov) in &self.tile_overrides {
            if tile >= self.num_tiles() {
                return Err(J2kError::NoSuchTile { tile });
            }
            if let Some(style) = &ov.style {
                style.validate()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_incomplete() {
        assert_eq!(
            CodingParams::default().validate(),
            Err(J2kError::MissingParameter("image size"))
        );
        assert!(CodingParams::new(64, 64, 1).validate().is_ok());
    }

    #[test]
    fn test_tile_grid() {
        let mut p = CodingParams::new(100, 60, 1);
        p.tile_width = 32;
        p.tile_height = 32;
        assert_eq!(p.tile_grid(), (4, 2));
        assert_eq!(p.tile_rect(3).unwrap(), Rect::new(96, 0, 100, 32));
        assert_eq!(p.tile_rect(8), Err(J2kError::NoSuchTile { tile: 8 }));
    }

    #[test]
    fn test_block_size_limits() {
        let mut p = CodingParams::new(64, 64, 1);
        p.style.block_width_exponent = 7;
        p.style.block_height_exponent = 6;
        assert!(matches!(
            p.validate(),
            Err(J2kError::InvalidPartition { what: "code-block", .. })
        ));
    }

    #[test]
    fn test_progression_codes() {
        assert_eq!(ProgressionOrder::try_from(2u8).unwrap(), ProgressionOrder::Rpcl);
        assert_eq!(u8::from(ProgressionOrder::Cprl), 4);
        assert!(ProgressionOrder::try_from(5u8).is_err());
        assert!(ProgressionOrder::Pcrl.layer_innermost());
    }

    #[test]
    fn test_overrides_make_tile_atypical() {
        let mut p = CodingParams::new(128, 64, 1);
        p.tile_width = 64;
        p.tile_overrides.insert(
            1,
            TileOverride {
                progression: Some(ProgressionOrder::Rlcp),
                ..TileOverride::default()
            },
        );
        assert!(p.is_typical(0));
        assert!(!p.is_typical(1));
        assert_eq!(p.progression_for(1), ProgressionOrder::Rlcp);
    }
}

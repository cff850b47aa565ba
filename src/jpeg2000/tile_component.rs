use crate::coding_parameters::{ComponentInfo, ComponentStyle};
use crate::error::J2kError;
use crate::jpeg2000::decomposition::NodeKind;
use crate::jpeg2000::geometry::{Coords, Rect};
use crate::jpeg2000::kernel::{KernelDescription, KernelId};
use crate::jpeg2000::resolution::{Resolution, ResolutionSpec};
use crate::profile::{ProfileCause, ProfileMonitor};
use std::sync::Arc;

/// Block size exponent above which a codestream leaves the Part 1 profiles.
const PROFILE_BLOCK_EXPONENT: u8 = 6;

/// Energy gain of the inverse colour transform for component `c`.
pub fn component_transform_gain(mct: bool, reversible: bool, c: usize) -> f64 {
    if !mct || c > 2 {
        return 1.0;
    }
    match (reversible, c) {
        (_, 0) => 3.0,
        (true, _) => 0.6875,
        (false, 1) => 0.344136 * 0.344136 + 1.772 * 1.772,
        (false, _) => 1.402 * 1.402 + 0.714136 * 0.714136,
    }
}

pub fn kernel_for(style: &ComponentStyle) -> Result<KernelDescription, J2kError> {
    match (style.kernel, &style.custom_taps) {
        (KernelId::Custom, Some((low, high))) => {
            KernelDescription::custom(style.reversible, low.clone(), high.clone())
        }
        (KernelId::Custom, None) => Err(J2kError::MissingParameter("custom_taps")),
        (id, _) => Ok(KernelDescription::new(id)),
    }
}

#[derive(Debug, Clone)]
pub struct TileComponent {
    pub index: usize,
    /// Tile region on this component's sample grid.
    pub rect: Rect,
    pub info: ComponentInfo,
    pub style: ComponentStyle,
    pub kernel: Arc<KernelDescription>,
    pub g_tc: f64,
    /// Lowest resolution first.
    pub resolutions: Vec<Resolution>,
}

impl TileComponent {
    pub fn new(
        index: usize,
        tile_rect: &Rect,
        info: &ComponentInfo,
        style: &ComponentStyle,
        partition_origin: Coords,
        mct: bool,
        profile: &ProfileMonitor,
    ) -> Result<Self, J2kError> {
        let kernel = Arc::new(kernel_for(style)?);
        let rect = tile_rect.subsample(Coords::new(info.sub_x as i64, info.sub_y as i64));
        let g_tc = component_transform_gain(mct, style.reversible, index);

        let num_res = style.num_resolutions();
        let mut built: Vec<Resolution> = Vec::with_capacity(num_res);
        let mut spec = ResolutionSpec {
            index: num_res - 1,
            rect,
            root_path_x: Vec::new(),
            root_path_y: Vec::new(),
            hor_depth: 0,
            vert_depth: 0,
            style,
            info,
            kernel: &kernel,
            partition_origin,
            g_tc,
        };
        let mut can_flip = true;
        for r in (0..num_res).rev() {
            spec.index = r;
            let mut res = Resolution::new(&spec)?;
            can_flip &= res.can_flip;
            res.can_flip = can_flip;
            if r > 0 {
                let next = res
                    .tree
                    .nodes
                    .iter()
                    .find(|n| n.kind == NodeKind::NextResolution)
                    .ok_or_else(|| {
                        J2kError::InconsistentDecomposition(format!(
                            "resolution {r} has no low-pass child"
                        ))
                    })?;
                spec.rect = next.rect;
                spec.root_path_x = next.path_x.clone();
                spec.root_path_y = next.path_y.clone();
                let primary = style.decomposition_code(res.dwt_level).primary();
                spec.hor_depth += primary.splits_x() as u8;
                spec.vert_depth += primary.splits_y() as u8;
            }
            built.push(res);
        }
        built.reverse();

        let tc = Self {
            index,
            rect,
            info: *info,
            style: style.clone(),
            kernel,
            g_tc,
            resolutions: built,
        };
        tc.note_profile(profile);
        Ok(tc)
    }

    fn note_profile(&self, profile: &ProfileMonitor) {
        if self.style.block_width_exponent > PROFILE_BLOCK_EXPONENT
            || self.style.block_height_exponent > PROFILE_BLOCK_EXPONENT
        {
            profile.note(ProfileCause::BlockSizeAboveProfile);
        }
        if self
            .resolutions
            .iter()
            .flat_map(|r| r.subbands.iter())
            .any(|b| b.block_clipped)
        {
            profile.note(ProfileCause::PrecinctSmallerThanBlock);
        }
        if !self.style.is_mallat() {
            profile.note(ProfileCause::NonMallatDecomposition);
        }
    }

    /// Moves every resolution to follow a tile of the same shape at a new position.
    pub fn reposition(&mut self, tile_rect: &Rect) -> Result<(), J2kError> {
        self.rect = tile_rect.subsample(Coords::new(self.info.sub_x as i64, self.info.sub_y as i64));
        let mut rect = self.rect;
        for r in (0..self.resolutions.len()).rev() {
            let res = &mut self.resolutions[r];
            res.reposition(rect)?;
            if r > 0 {
                rect = res.tree.next_resolution_rect().ok_or_else(|| {
                    J2kError::InconsistentDecomposition(format!("resolution {r} has no low-pass child"))
                })?;
            }
        }
        Ok(())
    }

    pub fn num_resolutions(&self) -> usize {
        self.resolutions.len()
    }

    pub fn resolution(&self, r: usize) -> Result<&Resolution, J2kError> {
        self.resolutions.get(r).ok_or(J2kError::ResolutionOutOfRange {
            requested: r,
            available: self.resolutions.len(),
        })
    }

    pub fn resolution_mut(&mut self, r: usize) -> Result<&mut Resolution, J2kError> {
        let available = self.resolutions.len();
        self.resolutions
            .get_mut(r)
            .ok_or(J2kError::ResolutionOutOfRange {
                requested: r,
                available,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_chain() {
        let style = ComponentStyle {
            levels: 2,
            ..ComponentStyle::default()
        };
        let info = ComponentInfo {
            sub_x: 2,
            ..ComponentInfo::default()
        };
        let profile = ProfileMonitor::new();
        let tc = TileComponent::new(
            1,
            &Rect::new(0, 0, 33, 20),
            &info,
            &style,
            Coords::new(0, 0),
            false,
            &profile,
        )
        .unwrap();
        assert_eq!(tc.rect, Rect::new(0, 0, 17, 20));
        assert_eq!(tc.num_resolutions(), 3);
        assert_eq!(tc.resolutions[2].rect, Rect::new(0, 0, 17, 20));
        assert_eq!(tc.resolutions[1].rect, Rect::new(0, 0, 9, 10));
        assert_eq!(tc.resolutions[0].rect, Rect::new(0, 0, 5, 5));
        assert_eq!(tc.resolutions[0].hor_depth, 2);
        assert_eq!(tc.resolutions[0].subbands.len(), 1);
        assert_eq!(tc.resolutions[2].subbands.len(), 3);
        assert!(tc.resolution(3).is_err());
        assert!(profile.relaxed_causes().is_empty());
    }

    #[test]
    fn test_part2_single_axis_levels() {
        // Finest level splits horizontally only.
        let style = ComponentStyle {
            levels: 2,
            decomposition_codes: vec![1, 3],
            ..ComponentStyle::default()
        };
        let profile = ProfileMonitor::new();
        let tc = TileComponent::new(
            0,
            &Rect::new(0, 0, 32, 32),
            &ComponentInfo::default(),
            &style,
            Coords::new(0, 0),
            false,
            &profile,
        )
        .unwrap();
        assert_eq!(tc.resolutions[2].subbands.len(), 1);
        assert_eq!(tc.resolutions[1].rect, Rect::new(0, 0, 16, 32));
        assert_eq!(tc.resolutions[1].hor_depth, 1);
        assert_eq!(tc.resolutions[1].vert_depth, 0);
        assert_eq!(tc.resolutions[0].rect, Rect::new(0, 0, 8, 16));
        assert!(profile.is_relaxed(ProfileCause::NonMallatDecomposition));
    }

    #[test]
    fn test_transform_gains() {
        assert_eq!(component_transform_gain(false, true, 0), 1.0);
        assert_eq!(component_transform_gain(true, true, 1), 0.6875);
        assert!((component_transform_gain(true, false, 2) - 2.4756).abs() < 1e-3);
        assert_eq!(component_transform_gain(true, false, 3), 1.0);
    }
}

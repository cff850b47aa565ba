//! Packet sequencing for the five progression orders.
//!
//! The sequencer is an odometer over five indices whose meaning depends on the order.
//! Position-driven orders (RPCL, PCRL, CPRL) walk the canvas positions at which some
//! precinct starts, and pick the precinct of each component and resolution that starts
//! there.

use crate::coding_parameters::ProgressionOrder;
use crate::jpeg2000::geometry::{Coords, Rect};
use crate::jpeg2000::resolution::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketRef {
    pub layer: u16,
    pub resolution: usize,
    pub component: usize,
    /// Absolute precinct indices within the resolution.
    pub precinct: Coords,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceScope {
    All,
    /// Only packets inside the current input restrictions.
    Relevant,
}

/// What the sequencer needs to know about one resolution of one tile-component.
#[derive(Debug, Clone)]
pub struct SequencerResolution {
    pub rect: Rect,
    pub precincts: Rect,
    pub relevant: Rect,
    pub origin: Coords,
    pub size: Coords,
    /// Canvas samples per resolution sample on each axis.
    pub div: Coords,
}

impl SequencerResolution {
    pub fn from_resolution(res: &Resolution, sub: Coords) -> Self {
        Self {
            rect: res.rect,
            precincts: res.precinct_indices,
            relevant: res.relevant_precincts,
            origin: res.precinct_partition.origin,
            size: res.precinct_partition.size,
            div: Coords::new(sub.x << res.hor_depth, sub.y << res.vert_depth),
        }
    }

    fn range(&self, scope: SequenceScope) -> Rect {
        match scope {
            SequenceScope::All => self.precincts,
            SequenceScope::Relevant => self.relevant,
        }
    }

    /// Canvas positions at which a precinct column (or row) of this resolution starts.
    fn starts(&self, tile0: i64, vertical: bool) -> Vec<i64> {
        let (r0, r1, o, s, d) = if vertical {
            (self.rect.y0, self.rect.y1, self.origin.y, self.size.y, self.div.y)
        } else {
            (self.rect.x0, self.rect.x1, self.origin.x, self.size.x, self.div.x)
        };
        let mut out = vec![tile0];
        if r1 <= r0 {
            return out;
        }
        // First boundary strictly inside the resolution.
        let k0 = (r0 - o).div_euclid(s) + 1;
        let mut e = o + k0 * s;
        while e < r1 {
            out.push(e * d);
            e += s;
        }
        out
    }

    /// Precinct index whose column (or row) starts at canvas position `pos`.
    fn select(&self, pos: i64, tile0: i64, vertical: bool) -> Option<i64> {
        let (r0, r1, o, s, d, first) = if vertical {
            (self.rect.y0, self.rect.y1, self.origin.y, self.size.y, self.div.y, self.precincts.y0)
        } else {
            (self.rect.x0, self.rect.x1, self.origin.x, self.size.x, self.div.x, self.precincts.x0)
        };
        if r1 <= r0 {
            return None;
        }
        if pos == tile0 {
            return Some(first);
        }
        if pos % d != 0 {
            return None;
        }
        let e = pos / d;
        if (e - o).rem_euclid(s) != 0 || e <= r0 || e >= r1 {
            return None;
        }
        Some((e - o).div_euclid(s))
    }
}

#[derive(Debug, Clone)]
pub struct SequencerLayout {
    /// Tile region on the canvas.
    pub tile: Rect,
    pub num_layers: u16,
    /// Layers inside the input restrictions.
    pub relevant_layers: u16,
    /// `[component][resolution]`
    pub components: Vec<Vec<SequencerResolution>>,
    /// Resolutions of each component inside the input restrictions.
    pub relevant_resolutions: Vec<usize>,
    pub relevant_components: Vec<bool>,
}

impl SequencerLayout {
    fn max_resolutions(&self) -> usize {
        self.components.iter().map(Vec::len).max().unwrap_or(0)
    }

    fn sorted(mut v: Vec<i64>) -> Vec<i64> {
        v.sort_unstable();
        v.dedup();
        v
    }

    fn positions<'a>(&self, items: impl Iterator<Item = &'a SequencerResolution>, vertical: bool) -> Vec<i64> {
        let tile0 = if vertical { self.tile.y0 } else { self.tile.x0 };
        let mut all = vec![tile0];
        for r in items {
            all.extend(r.starts(tile0, vertical));
        }
        Self::sorted(all)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dim {
    Layer,
    Resolution,
    Component,
    PrecinctY,
    PrecinctX,
    PositionY,
    PositionX,
}

fn dims(order: ProgressionOrder) -> [Dim; 5] {
    use Dim::*;
    match order {
        ProgressionOrder::Lrcp => [Layer, Resolution, Component, PrecinctY, PrecinctX],
        ProgressionOrder::Rlcp => [Resolution, Layer, Component, PrecinctY, PrecinctX],
        ProgressionOrder::Rpcl => [Resolution, PositionY, PositionX, Component, Layer],
        ProgressionOrder::Pcrl => [PositionY, PositionX, Component, Resolution, Layer],
        ProgressionOrder::Cprl => [Component, PositionY, PositionX, Resolution, Layer],
    }
}

#[derive(Debug, Clone)]
pub struct PacketSequencer {
    order: ProgressionOrder,
    scope: SequenceScope,
    dims: [Dim; 5],
    idx: [usize; 5],
    started: bool,
    done: bool,
    /// Global position lists (PCRL).
    pos_x: Vec<i64>,
    pos_y: Vec<i64>,
    /// Position lists per resolution (RPCL) or per component (CPRL).
    grouped_x: Vec<Vec<i64>>,
    grouped_y: Vec<Vec<i64>>,
    layout: SequencerLayout,
}

impl PacketSequencer {
    pub fn new(order: ProgressionOrder, scope: SequenceScope, layout: SequencerLayout) -> Self {
        let mut s = Self {
            order,
            scope,
            dims: dims(order),
            idx: [0; 5],
            started: false,
            done: false,
            pos_x: Vec::new(),
            pos_y: Vec::new(),
            grouped_x: Vec::new(),
            grouped_y: Vec::new(),
            layout,
        };
        s.build_positions();
        s
    }

    fn build_positions(&mut self) {
        let l = &self.layout;
        match self.order {
            ProgressionOrder::Pcrl => {
                self.pos_x = l.positions(l.components.iter().flatten(), false);
                self.pos_y = l.positions(l.components.iter().flatten(), true);
            }
            ProgressionOrder::Rpcl => {
                let per_res = |vertical: bool| {
                    (0..l.max_resolutions())
                        .map(|r| l.positions(l.components.iter().filter_map(|c| c.get(r)), vertical))
                        .collect()
                };
                self.grouped_x = per_res(false);
                self.grouped_y = per_res(true);
            }
            ProgressionOrder::Cprl => {
                self.grouped_x = l.components.iter().map(|c| l.positions(c.iter(), false)).collect();
                self.grouped_y = l.components.iter().map(|c| l.positions(c.iter(), true)).collect();
            }
            _ => {}
        }
    }

    pub fn order(&self) -> ProgressionOrder {
        self.order
    }

    pub fn layout(&self) -> &SequencerLayout {
        &self.layout
    }

    /// Returns to the first packet.
    pub fn restart(&mut self) {
        self.idx = [0; 5];
        self.started = false;
        self.done = false;
    }

    fn value(&self, d: Dim) -> usize {
        self.dims
            .iter()
            .position(|&x| x == d)
            .map_or(0, |k| self.idx[k])
    }

    fn layer_bound(&self) -> usize {
        match self.scope {
            SequenceScope::All => self.layout.num_layers as usize,
            SequenceScope::Relevant => self.layout.relevant_layers as usize,
        }
    }

    fn res_bound(&self, c: Option<usize>) -> usize {
        match c {
            Some(c) => match self.scope {
                SequenceScope::All => self.layout.components.get(c).map_or(0, Vec::len),
                SequenceScope::Relevant => self.layout.relevant_resolutions.get(c).copied().unwrap_or(0),
            },
            None => match self.scope {
                SequenceScope::All => self.layout.max_resolutions(),
                SequenceScope::Relevant => self.layout.relevant_resolutions.iter().copied().max().unwrap_or(0),
            },
        }
    }

    fn component_ok(&self, c: usize) -> bool {
        match self.scope {
            SequenceScope::All => true,
            SequenceScope::Relevant => self.layout.relevant_components.get(c).copied().unwrap_or(false),
        }
    }

    fn resolution(&self, c: usize, r: usize) -> Option<&SequencerResolution> {
        if r >= self.res_bound(Some(c)) || !self.component_ok(c) {
            return None;
        }
        self.layout.components.get(c)?.get(r)
    }

    fn position_list(&self, vertical: bool) -> &[i64] {
        let (global, grouped) = if vertical {
            (&self.pos_y, &self.grouped_y)
        } else {
            (&self.pos_x, &self.grouped_x)
        };
        match self.order {
            ProgressionOrder::Pcrl => global,
            ProgressionOrder::Rpcl => grouped
                .get(self.value(Dim::Resolution))
                .map_or(&[][..], |v| &v[..]),
            ProgressionOrder::Cprl => grouped
                .get(self.value(Dim::Component))
                .map_or(&[][..], |v| &v[..]),
            _ => &[],
        }
    }

    fn bound(&self, k: usize) -> usize {
        match self.dims[k] {
            Dim::Layer => self.layer_bound(),
            Dim::Resolution => {
                // Component-major orders know the component when visiting resolutions.
                let c = self.dims[..k]
                    .contains(&Dim::Component)
                    .then(|| self.value(Dim::Component));
                self.res_bound(c)
            }
            Dim::Component => self.layout.components.len(),
            Dim::PrecinctY | Dim::PrecinctX => {
                let c = self.value(Dim::Component);
                let r = self.value(Dim::Resolution);
                match self.resolution(c, r) {
                    Some(res) => {
                        let range = res.range(self.scope);
                        if self.dims[k] == Dim::PrecinctY {
                            range.height() as usize
                        } else {
                            range.width() as usize
                        }
                    }
                    None => 0,
                }
            }
            Dim::PositionY => self.position_list(true).len(),
            Dim::PositionX => self.position_list(false).len(),
        }
    }

    fn normalize(&mut self) -> bool {
        let mut k = 0;
        while k < 5 {
            if self.idx[k] < self.bound(k) {
                k += 1;
                continue;
            }
            if k == 0 {
                return false;
            }
            for j in k..5 {
                self.idx[j] = 0;
            }
            self.idx[k - 1] += 1;
            k -= 1;
        }
        true
    }

    fn packet_at(&self) -> Option<PacketRef> {
        let layer = self.value(Dim::Layer) as u16;
        let c = self.value(Dim::Component);
        let r = self.value(Dim::Resolution);
        let res = self.resolution(c, r)?;
        let range = res.range(self.scope);
        let precinct = match self.order {
            ProgressionOrder::Lrcp | ProgressionOrder::Rlcp => Coords::new(
                range.x0 + self.value(Dim::PrecinctX) as i64,
                range.y0 + self.value(Dim::PrecinctY) as i64,
            ),
            _ => {
                let x = *self.position_list(false).get(self.value(Dim::PositionX))?;
                let y = *self.position_list(true).get(self.value(Dim::PositionY))?;
                let p = Coords::new(
                    res.select(x, self.layout.tile.x0, false)?,
                    res.select(y, self.layout.tile.y0, true)?,
                );
                if !range.contains(p) {
                    return None;
                }
                p
            }
        };
        Some(PacketRef {
            layer,
            resolution: r,
            component: c,
            precinct,
        })
    }

    /// Next packet in sequence, or `None` once the tile is exhausted.
    pub fn next_packet(&mut self) -> Option<PacketRef> {
        loop {
            if self.done {
                return None;
            }
            if self.started {
                self.idx[4] += 1;
            } else {
                self.started = true;
            }
            if !self.normalize() {
                self.done = true;
                return None;
            }
            if let Some(p) = self.packet_at() {
                return Some(p);
            }
        }
    }

    /// Next packet without advancing.
    pub fn peek(&self) -> Option<PacketRef> {
        self.clone().next_packet()
    }

    pub fn is_exhausted(&self) -> bool {
        self.peek().is_none()
    }

    /// Packets left from the current position.
    pub fn remaining(&self) -> u64 {
        let mut probe = self.clone();
        let mut n = 0;
        while probe.next_packet().is_some() {
            n += 1;
        }
        n
    }
}

impl Iterator for PacketSequencer {
    type Item = PacketRef;

    fn next(&mut self) -> Option<PacketRef> {
        self.next_packet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn res(rect: Rect, size: i64, div: i64) -> SequencerResolution {
        let origin = Coords::new(0, 0);
        let size = Coords::new(size, size);
        let precincts = Rect::new(
            rect.x0.div_euclid(size.x),
            rect.y0.div_euclid(size.y),
            (rect.x1 + size.x - 1).div_euclid(size.x),
            (rect.y1 + size.y - 1).div_euclid(size.y),
        );
        SequencerResolution {
            rect,
            precincts,
            relevant: precincts,
            origin,
            size,
            div: Coords::new(div, div),
        }
    }

    /// A 64x64 tile at (16, 16), two components, two resolutions each.
    fn layout() -> SequencerLayout {
        let comp = vec![
            res(Rect::new(8, 8, 40, 40), 16, 2),
            res(Rect::new(16, 16, 80, 80), 16, 1),
        ];
        SequencerLayout {
            tile: Rect::new(16, 16, 80, 80),
            num_layers: 2,
            relevant_layers: 2,
            components: vec![comp.clone(), comp],
            relevant_resolutions: vec![2, 2],
            relevant_components: vec![true, true],
        }
    }

    fn total(l: &SequencerLayout) -> usize {
        let per_layer: i64 = l.components.iter().flatten().map(|r| r.precincts.area()).sum();
        per_layer as usize * l.num_layers as usize
    }

    #[test]
    fn test_every_order_visits_each_packet_once() {
        for order in [
            ProgressionOrder::Lrcp,
            ProgressionOrder::Rlcp,
            ProgressionOrder::Rpcl,
            ProgressionOrder::Pcrl,
            ProgressionOrder::Cprl,
        ] {
            let l = layout();
            let expected = total(&l);
            let seq = PacketSequencer::new(order, SequenceScope::All, l);
            let packets: Vec<PacketRef> = seq.collect();
            let unique: HashSet<PacketRef> = packets.iter().copied().collect();
            assert_eq!(packets.len(), expected, "{}", order.name());
            assert_eq!(unique.len(), expected, "{}", order.name());
        }
    }

    #[test]
    fn test_lrcp_order() {
        let seq = PacketSequencer::new(ProgressionOrder::Lrcp, SequenceScope::All, layout());
        let packets: Vec<PacketRef> = seq.collect();
        assert_eq!(packets[0].layer, 0);
        assert_eq!(packets[0].resolution, 0);
        assert_eq!(packets[0].precinct, Coords::new(0, 0));
        assert!(packets.windows(2).all(|w| w[0].layer <= w[1].layer));
    }

    #[test]
    fn test_layer_innermost_orders() {
        for order in [ProgressionOrder::Rpcl, ProgressionOrder::Pcrl, ProgressionOrder::Cprl] {
            let seq = PacketSequencer::new(order, SequenceScope::All, layout());
            let packets: Vec<PacketRef> = seq.collect();
            for pair in packets.chunks(2) {
                assert_eq!(pair[0].layer, 0);
                assert_eq!(pair[1].layer, 1);
                assert_eq!(pair[0].precinct, pair[1].precinct);
            }
        }
    }

    #[test]
    fn test_rpcl_is_resolution_major_and_spatial() {
        let seq = PacketSequencer::new(ProgressionOrder::Rpcl, SequenceScope::All, layout());
        let packets: Vec<PacketRef> = seq.collect();
        assert!(packets.windows(2).all(|w| w[0].resolution <= w[1].resolution));
        // Within resolution 1, rows come before columns.
        let r1: Vec<Coords> = packets
            .iter()
            .filter(|p| p.resolution == 1 && p.component == 0 && p.layer == 0)
            .map(|p| p.precinct)
            .collect();
        assert_eq!(r1[0], Coords::new(1, 1));
        assert_eq!(r1[1], Coords::new(2, 1));
    }

    #[test]
    fn test_relevant_scope_skips_empty_region() {
        let mut l = layout();
        l.components[1][1].relevant = Rect::default();
        l.relevant_layers = 1;
        let all = total(&layout()) / 2;
        let skipped = l.components[1][1].precincts.area() as usize;
        for order in [ProgressionOrder::Lrcp, ProgressionOrder::Pcrl] {
            let seq = PacketSequencer::new(order, SequenceScope::Relevant, l.clone());
            let packets: Vec<PacketRef> = seq.collect();
            assert_eq!(packets.len(), all - skipped);
            assert!(!packets.iter().any(|p| p.component == 1 && p.resolution == 1));
        }
    }

    #[test]
    fn test_restart_and_remaining() {
        let mut seq = PacketSequencer::new(ProgressionOrder::Cprl, SequenceScope::All, layout());
        let first = seq.next_packet();
        let before = seq.remaining();
        seq.restart();
        assert_eq!(seq.next_packet(), first);
        assert_eq!(seq.remaining(), before);
    }
}

#![allow(dead_code)]

use j2kcs_rs::{BlockEncoding, CodingParams, Coords, Tile};

pub const PASSES: usize = 10;

/// Single-component 8-bit parameters with `levels` decomposition levels and square
/// code-blocks of `1 << block_exp`.
pub fn params(width: u32, height: u32, tile: u32, levels: u8, block_exp: u8) -> CodingParams {
    let mut p = CodingParams::new(width, height, 1);
    p.tile_width = tile;
    p.tile_height = tile;
    p.style.levels = levels;
    p.style.block_width_exponent = block_exp;
    p.style.block_height_exponent = block_exp;
    p
}

/// Deterministic stand-in for a block coder. Bytes stay below 0xF0 so packet bodies
/// never imitate a marker.
pub fn synthetic_block(area: i64, resolution: usize, seed: usize) -> BlockEncoding {
    let per_pass = ((area / 8).max(1) as u32).min(512);
    let lengths: Vec<u32> = (1..=PASSES as u32).map(|p| p * per_pass).collect();
    let total = per_pass as usize * PASSES;
    let bytes = (0..total).map(|i| ((i * 31 + seed * 7) % 0xF0) as u8).collect();
    let base = 60000u32.saturating_sub(resolution as u32 * 1500);
    let slopes = (0..PASSES as u32)
        .map(|p| base.saturating_sub(p * 5000).max(1) as u16)
        .collect();
    BlockEncoding::new(bytes, lengths, slopes, 1).unwrap()
}

/// Every code-block of a component as `(resolution, band, block, area)`.
pub fn blocks_of(tile: &Tile, c: usize) -> Vec<(usize, usize, Coords, i64)> {
    let tc = tile.component(c).unwrap();
    let mut out = Vec::new();
    for r in 0..tc.num_resolutions() {
        for band in &tc.resolution(r).unwrap().subbands {
            for i in 0..band.block_indices.area() as usize {
                let idx = band.block_indices.position_of(i);
                out.push((r, band.index, idx, band.block_rect(idx).area()));
            }
        }
    }
    out
}

/// The encoding [`store_tile`] hands over for one block.
pub fn expected_block(tile: u32, c: usize, r: usize, block: Coords, area: i64) -> BlockEncoding {
    let seed = tile as usize * 131 + c * 17 + (block.x * 5 + block.y * 3) as usize;
    synthetic_block(area, r, seed)
}

/// Stores every block of every component and closes the tile.
pub fn store_tile(tile: &mut Tile) {
    for c in 0..tile.num_components() {
        for (r, band, block, area) in blocks_of(tile, c) {
            let enc = expected_block(tile.index, c, r, block, area);
            tile.store_block(c, r, band, block, enc).unwrap();
        }
    }
    tile.close();
}

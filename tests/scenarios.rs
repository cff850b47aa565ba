mod common;

use common::{blocks_of, expected_block, params, store_tile};
use j2kcs_rs::jpeg2000::precinct_server::PrecinctServer;
use j2kcs_rs::{Codestream, J2kError, MemorySource, MemoryTarget, ProfileMonitor, Tile};
use std::sync::Arc;

#[test]
fn test_layer_targets_bound_cumulative_bytes() {
    let targets = [1000u64, 4000, 10000];
    let mut p = params(128, 128, 128, 2, 5);
    p.num_layers = 3;
    let mut cs = Codestream::create_output(p).unwrap();
    cs.set_max_bytes(&targets).unwrap();
    store_tile(cs.open_tile(0).unwrap());

    let mut out = MemoryTarget::new();
    let report = cs.flush(&mut out).unwrap();
    let total = cs.finish(&mut out).unwrap();
    assert!(total <= 10000, "codestream is {total} bytes");
    assert!(total > 4000);

    // Main header, one SOT + SOD, EOC.
    let overhead = cs.header_bytes() + 14 + 2;
    let mut cumulative = 0;
    for (l, &bytes) in report.plan.layer_bytes.iter().enumerate() {
        let next = cumulative + bytes;
        assert!(next >= cumulative);
        assert!(overhead + next <= targets[l], "layer {l}: {}", overhead + next);
        cumulative = next;
    }
    assert!(report.plan.thresholds.windows(2).all(|w| w[0] >= w[1]));

    let mut src = MemorySource::new(out.into_inner());
    let mut input = Codestream::open_input(&mut src).unwrap();
    let parts = input.read_all(&mut src).unwrap();
    assert_eq!(parts.len(), 1);
    // Three precincts, one per resolution, three packets each.
    assert_eq!(parts[0].read.parsed, 9);
}

fn find_sop(data: &[u8], seq: u16) -> usize {
    let s = seq.to_be_bytes();
    let pattern = [0xFF, 0x91, 0x00, 0x04, s[0], s[1]];
    data.windows(6).position(|w| w == pattern).unwrap()
}

#[test]
fn test_corrupted_sop_is_skipped_and_next_tile_intact() {
    let mut p = params(64, 32, 32, 1, 4);
    p.num_layers = 3;
    p.use_sop = true;
    let mut cs = Codestream::create_output(p.clone()).unwrap();
    store_tile(cs.open_tile(0).unwrap());
    store_tile(cs.open_tile(1).unwrap());
    let mut out = MemoryTarget::new();
    cs.finish(&mut out).unwrap();
    let mut data = out.into_inner();

    // Packet 2 of tile 0 is layer 1 of the lowest resolution.
    let at = find_sop(&data, 2);
    data[at + 5] = 0x63;

    let mut src = MemorySource::new(data.clone());
    let mut strict = Codestream::open_input(&mut src).unwrap();
    let err = strict.read_all(&mut src).unwrap_err();
    assert!(err.is_corruption());
    assert!(matches!(err, J2kError::SopSequenceMismatch { expected: 2, found: 0x63 }));

    p.resilient = true;
    let mut src = MemorySource::new(data);
    let mut input = Codestream::open_input_with_params(&mut src, p).unwrap();
    let parts = input.read_all(&mut src).unwrap();
    assert_eq!(parts.len(), 2);
    let damaged = parts[0].read;
    assert_eq!(damaged.recoveries, 1);
    // The damaged packet, then layer 2 of the same precinct.
    assert_eq!(damaged.skipped, 2);
    assert_eq!(damaged.parsed, 4);
    assert_eq!(parts[1].read.parsed, 6);
    assert_eq!(parts[1].read.skipped, 0);

    let tile = input.tile(1).unwrap();
    for (r, band, block, area) in blocks_of(tile, 0) {
        let got = tile.retrieve_block(0, r, band, block).unwrap();
        assert_eq!(got.bytes, expected_block(1, 0, r, block, area).bytes);
    }
}

#[test]
fn test_corrupted_sop_number_within_gap_window_keeps_later_packets() {
    let mut p = params(64, 32, 32, 1, 4);
    p.num_layers = 3;
    p.use_sop = true;
    let mut cs = Codestream::create_output(p.clone()).unwrap();
    store_tile(cs.open_tile(0).unwrap());
    store_tile(cs.open_tile(1).unwrap());
    let mut out = MemoryTarget::new();
    cs.finish(&mut out).unwrap();
    let mut data = out.into_inner();

    // Two ahead of the expected number, so the damaged marker itself looks like a
    // plausible resynchronisation point.
    let at = find_sop(&data, 2);
    data[at + 5] = 4;

    let mut src = MemorySource::new(data.clone());
    let mut strict = Codestream::open_input(&mut src).unwrap();
    let err = strict.read_all(&mut src).unwrap_err();
    assert!(matches!(err, J2kError::SopSequenceMismatch { expected: 2, found: 4 }));

    p.resilient = true;
    let mut src = MemorySource::new(data);
    let mut input = Codestream::open_input_with_params(&mut src, p).unwrap();
    let parts = input.read_all(&mut src).unwrap();
    let damaged = parts[0].read;
    assert_eq!(damaged.recoveries, 1);
    assert_eq!(damaged.skipped, 2);
    assert_eq!(damaged.parsed, 4);

    // Every layer of the upper resolution survives.
    let tile = input.tile(0).unwrap();
    for (r, band, block, area) in blocks_of(tile, 0).into_iter().filter(|b| b.0 == 1) {
        let got = tile.retrieve_block(0, r, band, block).unwrap();
        assert_eq!(got.bytes, expected_block(0, 0, r, block, area).bytes);
    }
}

#[test]
fn test_zero_interruption_budget_abandons_until_ready() {
    let p = params(32, 32, 32, 1, 4);
    let mut cs = Codestream::create_output(p).unwrap();
    let tile = cs.open_tile(0).unwrap();
    let blocks = blocks_of(tile, 0);
    // Everything except the lowest resolution, which comes first in LRCP.
    for &(r, band, block, area) in blocks.iter().filter(|b| b.0 == 1) {
        tile.store_block(0, r, band, block, expected_block(0, 0, r, block, area))
            .unwrap();
    }

    let mut out = MemoryTarget::new();
    let first = cs.flush(&mut out).unwrap();
    assert!(first.tile_parts.is_empty());
    assert_eq!(cs.tile(0).unwrap().tile_parts(), 0);
    let after_header = out.as_slice().len();
    assert_eq!(after_header as u64, cs.header_bytes());

    let (r, band, block, area) = blocks[0];
    assert_eq!(r, 0);
    let tile = cs.tile_mut(0).unwrap();
    tile.store_block(0, r, band, block, expected_block(0, 0, r, block, area))
        .unwrap();
    tile.close();
    let second = cs.flush(&mut out).unwrap();
    assert_eq!(second.tile_parts.len(), 1);
    assert_eq!(second.tile_parts[0].packets, 2);
    assert!(second.tile_parts[0].final_part);
    cs.finish(&mut out).unwrap();

    let mut src = MemorySource::new(out.into_inner());
    let mut input = Codestream::open_input(&mut src).unwrap();
    let parts = input.read_all(&mut src).unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].read.parsed, 2);
}

#[test]
fn test_recycled_tile_matches_fresh_tile() {
    let p = params(64, 64, 32, 2, 3);
    let mut cs = Codestream::create_output(p.clone()).unwrap();
    store_tile(cs.open_tile(0).unwrap());
    let mut out = MemoryTarget::new();
    let report = cs.flush(&mut out).unwrap();
    assert_eq!(report.released, vec![0]);
    assert_eq!(cs.recycle_pool_len(), 1);

    let recycled = cs.open_tile(3).unwrap();
    assert!(recycled.recycled);
    let fresh = Tile::new(
        3,
        Arc::new(p),
        Arc::new(PrecinctServer::new()),
        Arc::new(ProfileMonitor::new()),
    )
    .unwrap();
    assert_eq!(recycled.rect, fresh.rect);
    assert_eq!(recycled.max_packets(), fresh.max_packets());
    for (a, b) in recycled.components.iter().zip(&fresh.components) {
        assert_eq!(a.rect, b.rect);
        for (ra, rb) in a.resolutions.iter().zip(&b.resolutions) {
            assert_eq!(ra.rect, rb.rect);
            assert_eq!(ra.subbands, rb.subbands);
        }
    }
    assert_eq!(cs.recycle_pool_len(), 0);

    store_tile(cs.open_tile(3).unwrap());
    cs.finish(&mut out).unwrap();
    let mut src = MemorySource::new(out.into_inner());
    let mut input = Codestream::open_input(&mut src).unwrap();
    input.read_all(&mut src).unwrap();
    let tile = input.tile(3).unwrap();
    for (r, band, block, area) in blocks_of(tile, 0) {
        let got = tile.retrieve_block(0, r, band, block).unwrap();
        assert_eq!(got.bytes, expected_block(3, 0, r, block, area).bytes);
    }
}

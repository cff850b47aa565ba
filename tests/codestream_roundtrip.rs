mod common;

use common::{PASSES, blocks_of, expected_block, params, store_tile};
use j2kcs_rs::{
    ComponentInfo, Codestream, InputRestrictions, MemorySource, MemoryTarget, ProgressionOrder,
};

const ORDERS: [ProgressionOrder; 5] = [
    ProgressionOrder::Lrcp,
    ProgressionOrder::Rlcp,
    ProgressionOrder::Rpcl,
    ProgressionOrder::Pcrl,
    ProgressionOrder::Cprl,
];

fn encode(order: ProgressionOrder) -> Vec<u8> {
    let mut p = params(64, 64, 32, 2, 3);
    p.components = vec![ComponentInfo::default(); 2];
    p.style.precinct_exponents = vec![(3, 3), (4, 4)];
    p.num_layers = 2;
    p.progression = order;
    p.use_sop = true;
    p.use_eph = true;
    p.write_plt = true;
    let mut cs = Codestream::create_output(p).unwrap();
    for t in 0..4 {
        store_tile(cs.open_tile(t).unwrap());
    }
    let mut out = MemoryTarget::new();
    cs.finish(&mut out).unwrap();
    out.into_inner()
}

#[test]
fn test_every_progression_round_trips() {
    for order in ORDERS {
        let mut src = MemorySource::new(encode(order));
        let mut input = Codestream::open_input(&mut src).unwrap();
        assert_eq!(input.params().progression, order);
        let parts = input.read_all(&mut src).unwrap();
        assert_eq!(parts.len(), 4, "{order:?}");
        for part in &parts {
            assert!(part.header.packet_lengths.is_some());
            // 2 layers x 2 components x (1 + 1 + 4) precincts.
            assert_eq!(part.read.parsed, 24, "{order:?}");
            assert_eq!(part.read.skipped, 0);
        }
        for t in 0..4 {
            let tile = input.tile(t).unwrap();
            for c in 0..2 {
                for (r, band, block, area) in blocks_of(tile, c) {
                    let got = tile.retrieve_block(c, r, band, block).unwrap();
                    let want = expected_block(t, c, r, block, area);
                    assert_eq!(got.bytes, want.bytes, "{order:?} tile {t} block {block:?}");
                    assert_eq!(got.passes as usize, PASSES);
                    assert_eq!(got.missing_msbs, 1);
                }
            }
        }
    }
}

#[test]
fn test_restrictions_limit_received_data() {
    let mut src = MemorySource::new(encode(ProgressionOrder::Lrcp));
    let mut input = Codestream::open_input(&mut src).unwrap();
    input
        .apply_input_restrictions(InputRestrictions {
            discard_levels: 1,
            max_layers: Some(1),
            ..InputRestrictions::default()
        })
        .unwrap();
    input.read_all(&mut src).unwrap();
    let tile = input.tile(0).unwrap();
    for (r, band, block, area) in blocks_of(tile, 0) {
        let got = tile.retrieve_block(0, r, band, block).unwrap();
        if r == 2 {
            assert!(got.bytes.is_empty());
        } else {
            let full = expected_block(0, 0, r, block, area).bytes;
            assert!(!got.bytes.is_empty());
            assert!(got.bytes.len() < full.len());
            assert_eq!(got.bytes[..], full[..got.bytes.len()]);
        }
    }
}

#[test]
fn test_empty_region_has_no_relevant_packets() {
    let mut src = MemorySource::new(encode(ProgressionOrder::Rpcl));
    let mut input = Codestream::open_input(&mut src).unwrap();
    input
        .apply_input_restrictions(InputRestrictions {
            region: Some(j2kcs_rs::Rect::new(0, 0, 32, 32)),
            ..InputRestrictions::default()
        })
        .unwrap();
    input.read_all(&mut src).unwrap();
    assert_eq!(input.tile(0).unwrap().max_relevant_packets(), 24);
    for t in 1..4 {
        assert_eq!(input.tile(t).unwrap().max_relevant_packets(), 0);
        assert_eq!(input.tile(t).unwrap().relevant_packets().count(), 0);
    }
}

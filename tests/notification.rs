mod common;

use common::{blocks_of, expected_block, params, store_tile};
use j2kcs_rs::Codestream;
use j2kcs_rs::jpeg2000::notifier::{DependencyQueue, ResolutionNotifier};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Default)]
struct Recorder {
    rows: [AtomicI64; 4],
    closed: [AtomicU32; 4],
}

impl DependencyQueue for Recorder {
    fn update_dependencies(&self, band: usize, delta: i32) {
        self.rows[band].fetch_add(delta as i64, Ordering::SeqCst);
    }

    fn band_closed(&self, band: usize) {
        self.closed[band].fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_rows_are_delivered_in_order() {
    let mut cs = Codestream::create_output(params(32, 32, 32, 1, 3)).unwrap();
    let tile = cs.open_tile(0).unwrap();
    let notifier = tile.notifier(0, 1).unwrap();
    let recorder = Arc::new(Recorder::default());
    assert_eq!(notifier.attach(recorder.clone()), vec![0, 0, 0]);

    // Band 0 of resolution 1 holds 2x2 blocks of 8x8; store its bottom row first.
    let mut band0: Vec<_> = blocks_of(tile, 0)
        .into_iter()
        .filter(|b| b.0 == 1 && b.1 == 0)
        .collect();
    band0.sort_by_key(|b| std::cmp::Reverse(b.2.y));
    for (i, &(r, band, block, area)) in band0.iter().enumerate() {
        tile.store_block(0, r, band, block, expected_block(0, 0, r, block, area))
            .unwrap();
        if i < 2 {
            assert_eq!(notifier.available_rows(0), 0);
        }
    }
    assert_eq!(notifier.available_rows(0), 2);
    assert_eq!(recorder.rows[0].load(Ordering::SeqCst), -2);
    assert_eq!(recorder.closed[0].load(Ordering::SeqCst), 1);
    assert_eq!(recorder.closed[1].load(Ordering::SeqCst), 0);
}

#[test]
fn test_parallel_tiles_close_every_band_once() {
    let mut cs = Codestream::create_output(params(64, 64, 32, 1, 3)).unwrap();
    let mut recorders = Vec::new();
    for t in 0..4 {
        let notifier = cs.open_tile(t).unwrap().notifier(0, 1).unwrap();
        let recorder = Arc::new(Recorder::default());
        notifier.attach(recorder.clone());
        recorders.push((notifier, recorder));
    }
    cs.for_each_tile_parallel(&[0, 1, 2, 3], |tile| {
        store_tile(tile);
        Ok(())
    })
    .unwrap();
    for (notifier, recorder) in &recorders {
        for band in 0..3 {
            assert!(notifier.closure_sent(band));
            assert_eq!(recorder.rows[band].load(Ordering::SeqCst), -2);
            assert_eq!(recorder.closed[band].load(Ordering::SeqCst), 1);
        }
    }
}

#[test]
fn test_concurrent_block_completion() {
    let notifier = ResolutionNotifier::new(&[vec![4; 8]]);
    let recorder = Arc::new(Recorder::default());
    notifier.attach(recorder.clone());
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for row in 0..8 {
                    notifier.block_done(0, row);
                }
            });
        }
    });
    assert_eq!(notifier.available_rows(0), 8);
    assert_eq!(recorder.rows[0].load(Ordering::SeqCst), -8);
    assert_eq!(recorder.closed[0].load(Ordering::SeqCst), 1);
}

#[test]
fn test_detach_postpones_then_closes_on_reattach() {
    let notifier = ResolutionNotifier::new(&[vec![1, 1]]);
    let first = Arc::new(Recorder::default());
    notifier.attach(first.clone());
    notifier.block_done(0, 0);
    notifier.request_detach();
    notifier.background_process();
    notifier.block_done(0, 1);
    assert_eq!(first.rows[0].load(Ordering::SeqCst), -1);
    assert_eq!(first.closed[0].load(Ordering::SeqCst), 0);

    let second = Arc::new(Recorder::default());
    assert_eq!(notifier.attach(second.clone()), vec![2]);
    assert_eq!(second.closed[0].load(Ordering::SeqCst), 1);
}

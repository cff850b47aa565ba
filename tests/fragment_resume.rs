mod common;

use common::{params, store_tile};
use j2kcs_rs::constants::RESUME_TRAILER_BYTES;
use j2kcs_rs::{Codestream, IoTarget, J2kError, MemorySource, MemoryTarget, ResumeState};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom};

fn single_run() -> Vec<u8> {
    let mut cs = Codestream::create_output(params(64, 32, 32, 1, 4)).unwrap();
    store_tile(cs.open_tile(0).unwrap());
    store_tile(cs.open_tile(1).unwrap());
    let mut out = MemoryTarget::new();
    cs.finish(&mut out).unwrap();
    out.into_inner()
}

#[test]
fn test_two_invocations_produce_one_codestream() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fragmented.j2k");
    let p = params(64, 32, 32, 1, 4);

    {
        let mut target = IoTarget::new(File::create(&path).unwrap(), 0);
        let mut cs = Codestream::create_output(p.clone()).unwrap();
        store_tile(cs.open_tile(0).unwrap());
        let state = cs.finish_fragment(&mut target).unwrap();
        assert_eq!(state.tiles_completed, 1);
        assert_eq!(state.last_tile_parts, 1);
        target.into_inner().unwrap();
    }

    let data = fs::read(&path).unwrap();
    let state = ResumeState::read(&data).unwrap();
    assert_eq!(state.bytes_written as usize, data.len() - RESUME_TRAILER_BYTES);

    {
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(state.bytes_written).unwrap();
        file.seek(SeekFrom::End(0)).unwrap();
        let mut target = IoTarget::new(file, state.bytes_written);
        let mut cs = Codestream::resume(p, state).unwrap();
        assert!(matches!(cs.open_tile(0), Err(J2kError::TileClosed { tile: 0 })));
        store_tile(cs.open_tile(1).unwrap());
        cs.finish(&mut target).unwrap();
        target.into_inner().unwrap();
    }

    let data = fs::read(&path).unwrap();
    assert_eq!(data, single_run());
    let mut src = MemorySource::new(data);
    let mut input = Codestream::open_input(&mut src).unwrap();
    let parts = input.read_all(&mut src).unwrap();
    let tiles: Vec<u16> = parts.iter().map(|s| s.header.tile).collect();
    assert_eq!(tiles, vec![0, 1]);
}

#[test]
fn test_fragment_requires_whole_tiles() {
    let mut cs = Codestream::create_output(params(64, 32, 32, 1, 4)).unwrap();
    cs.open_tile(0).unwrap();
    let mut out = MemoryTarget::new();
    assert!(cs.finish_fragment(&mut out).is_err());
}

#[test]
fn test_resume_rejects_impossible_state() {
    let state = ResumeState {
        tiles_completed: 3,
        bytes_written: 100,
        last_tile_parts: 1,
    };
    assert!(Codestream::resume(params(64, 32, 32, 1, 4), state).is_err());
}

//! JPEG 2000 Part 1 codestream management (ISO/IEC 15444-1).
//!
//! Structure and bookkeeping only: canvas geometry, precinct storage, packet headers,
//! progression orders, rate control and tile-part framing. Wavelet transforms and
//! block coding are supplied by the application through [`code_block::BlockEncoding`].
//!
//! - `codestream`: top-level driver for output and input.
//! - `tile` / `tile_component` / `resolution` / `subband`: the tile hierarchy.
//! - `precinct` / `precinct_server`: packet-level storage and its allocator.
//! - `packet` / `tag_tree` / `bit_io`: packet header coding.
//! - `progression`: the five packet orders and POC-style sequencing.
//! - `rate_control`: layer threshold search and CBR filling.
//! - `parser` / `writer`: marker segments.

pub mod bit_io;
pub mod code_block;
pub mod codestream;
pub mod decomposition;
pub mod geometry;
pub mod kernel;
pub mod notifier;
pub mod packet;
pub mod parser;
pub mod precinct;
pub mod precinct_server;
pub mod progression;
pub mod quantization;
pub mod rate_control;
pub mod resolution;
pub mod subband;
pub mod tag_tree;
pub mod tile;
pub mod tile_component;
pub mod writer;

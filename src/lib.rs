//! Codestream management for JPEG 2000 Part 1.
//!
//! The crate builds and parses codestreams at the packet level. An encoder hands in
//! block-coded data per code-block and gets back sized, ordered tile-parts; a decoder
//! reads tile-parts and retrieves the received pass data per code-block.

pub mod coding_parameters;
pub mod constants;
pub mod error;
pub mod jpeg2000;
pub mod jpeg_marker_code;
pub mod profile;
pub mod stream_reader;
pub mod stream_writer;

pub use coding_parameters::{
    CodingParams, ComponentInfo, ComponentStyle, ProgressionOrder, RateParams, TileOverride,
    TilePartDivision,
};
pub use error::{ErrorKind, J2kError};
pub use jpeg2000::code_block::{BlockEncoding, ReceivedBlock};
pub use jpeg2000::codestream::{Codestream, Direction, FlushReport, TilePartSummary};
pub use jpeg2000::geometry::{Coords, Rect};
pub use jpeg2000::parser::ResumeState;
pub use jpeg2000::tile::{InputRestrictions, Tile};
pub use profile::{ProfileCause, ProfileMonitor};
pub use stream_reader::{CompressedSource, IoSource, MemorySource, SequentialSource};
pub use stream_writer::{CompressedTarget, CountingTarget, IoTarget, MemoryTarget};

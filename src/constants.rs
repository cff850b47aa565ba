pub const MARKER_START_BYTE: u8 = 0xFF;

// Tile-part limits as defined in ISO/IEC 15444-1, A.4.2.
pub const MAXIMUM_TILE_PARTS: usize = 255;
pub const MAXIMUM_TILE_PART_INDEX: u8 = 254;
pub const MAXIMUM_TILES: u32 = 65535;

pub const MAXIMUM_LAYERS: u16 = 65535;
pub const MAXIMUM_DWT_LEVELS: u8 = 32;
pub const MAXIMUM_COMPONENTS: u16 = 16384;

// Code-block size exponents (xcb, ycb) are offsets from 2; blocks are at most 4096 samples.
pub const MINIMUM_BLOCK_EXPONENT: u8 = 2;
pub const MAXIMUM_BLOCK_EXPONENT: u8 = 10;
pub const MAXIMUM_BLOCK_AREA_EXPONENT: u8 = 12;
pub const MAXIMUM_PRECINCT_EXPONENT: u8 = 15;

// A single code-block contribution may carry at most 164 coding passes (B.10.6).
pub const MAXIMUM_PASSES_PER_CONTRIBUTION: u16 = 164;
pub const MAXIMUM_MAGNITUDE_BITS: u8 = 37;
pub const INITIAL_LBLOCK: u8 = 3;

// Marker segment sizes in bytes, marker code included.
pub const SOT_SEGMENT_BYTES: u64 = 12;
pub const SOD_MARKER_BYTES: u64 = 2;
pub const SOP_SEGMENT_BYTES: u64 = 6;
pub const EPH_MARKER_BYTES: u64 = 2;
/// Lsot field value; the SOT segment body is always 10 bytes.
pub const SOT_LENGTH_FIELD: u16 = 10;
pub const SOP_LENGTH_FIELD: u16 = 4;

// Temporary end marker (2) + tiles completed (4) + bytes written (8) + tile-parts of the last tile (1).
pub const RESUME_TRAILER_BYTES: usize = 15;

pub const CBR_FILLER_QUANTUM: u32 = 8192;

/// How far ahead of the expected SOP sequence number a resynchronisation candidate may be.
pub const MAXIMUM_SOP_GAP: u16 = 512;

/// Threshold that excludes every coding pass.
pub const MAXIMUM_SLOPE_THRESHOLD: u16 = 0xFFFF;

pub const PLT_MAXIMUM_SEGMENT_BYTES: usize = 65533;

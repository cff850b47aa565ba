use thiserror::Error;

/// Broad classification of a [`J2kError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or invalid coding attributes. Never recoverable at this layer.
    Parameter,
    /// Profile violations. These are downgraded to warnings by `ProfileMonitor`.
    Profile,
    /// Damaged codestream data found while decoding.
    Corruption,
    /// The target exceeds what the codestream syntax can represent.
    ResourceLimit,
    /// The caller used the API out of order or out of range.
    Usage,
    /// The underlying byte source or target failed.
    Io,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum J2kError {
    // Parameter inconsistencies
    #[error("Missing coding parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid coding parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("Inconsistent decomposition structure: {0}")]
    InconsistentDecomposition(String),
    #[error("Invalid {what} partition: size {width}x{height}, origin ({origin_x},{origin_y})")]
    InvalidPartition {
        what: &'static str,
        width: i64,
        height: i64,
        origin_x: i64,
        origin_y: i64,
    },
    #[error("Coding style not supported: {0}")]
    UnsupportedCodingStyle(String),

    // Corrupted stream conditions
    #[error("Unexpected end of compressed data")]
    UnexpectedEnd,
    #[error("Expected marker {expected:#06x}, found {found:#06x}")]
    MarkerMismatch { expected: u16, found: u16 },
    #[error("SOP sequence number mismatch: expected {expected}, found {found}")]
    SopSequenceMismatch { expected: u16, found: u16 },
    #[error("Malformed packet header: {0}")]
    MalformedPacketHeader(String),
    #[error("Malformed tile-part header: {0}")]
    MalformedTilePartHeader(String),
    #[error("Malformed main header: {0}")]
    MalformedMainHeader(String),
    #[error("EPH marker missing after packet header")]
    MissingEph,
    #[error("Packet data of a seek-addressed precinct is corrupt: {0}")]
    CorruptAddressedPrecinct(String),

    // Resource limits
    #[error("Tile {tile} needs more than 255 tile-parts")]
    TooManyTileParts { tile: u32 },
    #[error("Too many precincts: {0}")]
    TooManyPrecincts(String),
    #[error("Tile-part length {length} exceeds the Psot field")]
    TilePartTooLong { length: u64 },
    #[error("Destination too small")]
    DestinationTooSmall,
    #[error("Value {value} does not fit the {field} field")]
    FieldOverflow { field: &'static str, value: u64 },

    // Usage violations
    #[error("Tile {tile} is closed")]
    TileClosed { tile: u32 },
    #[error("Tile {tile} does not exist")]
    NoSuchTile { tile: u32 },
    #[error("Code-block {x},{y} already holds coded data")]
    BlockAlreadyStored { x: i64, y: i64 },
    #[error("Resolution {requested} out of range (available {available})")]
    ResolutionOutOfRange { requested: usize, available: usize },
    #[error("Component {requested} out of range (available {available})")]
    ComponentOutOfRange { requested: usize, available: usize },
    #[error("Position {what} {x},{y} out of range")]
    PositionOutOfRange { what: &'static str, x: i64, y: i64 },
    #[error("Precinct still has {outstanding} outstanding code-blocks")]
    PrecinctNotReady { outstanding: u32 },
    #[error("Packet length mismatch: simulated {simulated} bytes, wrote {written}")]
    SimulationMismatch { simulated: u64, written: u64 },
    #[error("Precinct data is no longer available")]
    PrecinctUnavailable,
    #[error("Invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("I/O error: {0}")]
    Io(String),
}

impl J2kError {
    /// Stable numeric code for this error.
    pub fn code(&self) -> u16 {
        match self {
            Self::MissingParameter(_) => 101,
            Self::InvalidParameter { .. } => 102,
            Self::InconsistentDecomposition(_) => 103,
            Self::InvalidPartition { .. } => 104,
            Self::UnsupportedCodingStyle(_) => 105,

            Self::UnexpectedEnd => 301,
            Self::MarkerMismatch { .. } => 302,
            Self::SopSequenceMismatch { .. } => 303,
            Self::MalformedPacketHeader(_) => 304,
            Self::MalformedTilePartHeader(_) => 305,
            Self::MalformedMainHeader(_) => 306,
            Self::MissingEph => 307,
            Self::CorruptAddressedPrecinct(_) => 308,

            Self::TooManyTileParts { .. } => 401,
            Self::TooManyPrecincts(_) => 402,
            Self::TilePartTooLong { .. } => 403,
            Self::DestinationTooSmall => 404,
            Self::FieldOverflow { .. } => 405,

            Self::TileClosed { .. } => 501,
            Self::NoSuchTile { .. } => 502,
            Self::BlockAlreadyStored { .. } => 503,
            Self::ResolutionOutOfRange { .. } => 504,
            Self::ComponentOutOfRange { .. } => 505,
            Self::PositionOutOfRange { .. } => 506,
            Self::PrecinctNotReady { .. } => 507,
            Self::SimulationMismatch { .. } => 508,
            Self::PrecinctUnavailable => 509,
            Self::InvalidOperation(_) => 510,

            Self::Io(_) => 601,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code() {
            100..=199 => ErrorKind::Parameter,
            200..=299 => ErrorKind::Profile,
            300..=399 => ErrorKind::Corruption,
            400..=499 => ErrorKind::ResourceLimit,
            500..=599 => ErrorKind::Usage,
            _ => ErrorKind::Io,
        }
    }

    /// True for damaged-stream conditions that resilient parsing may skip over.
    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }

    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for J2kError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            J2kError::UnexpectedEnd
        } else {
            J2kError::Io(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_taxonomy() {
        assert_eq!(J2kError::MissingParameter("levels").kind(), ErrorKind::Parameter);
        assert_eq!(J2kError::UnexpectedEnd.kind(), ErrorKind::Corruption);
        assert_eq!(
            J2kError::TooManyTileParts { tile: 3 }.kind(),
            ErrorKind::ResourceLimit
        );
        assert_eq!(J2kError::TileClosed { tile: 0 }.kind(), ErrorKind::Usage);
        assert_eq!(J2kError::Io("x".into()).kind(), ErrorKind::Io);
        assert!(J2kError::MissingEph.is_corruption());
    }

    #[test]
    fn test_display() {
        let err = J2kError::SopSequenceMismatch {
            expected: 4,
            found: 9,
        };
        assert_eq!(
            err.to_string(),
            "SOP sequence number mismatch: expected 4, found 9"
        );
        assert_eq!(err.code(), 303);
    }

    #[test]
    fn test_io_eof_maps_to_unexpected_end() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(J2kError::from(io), J2kError::UnexpectedEnd);
    }
}

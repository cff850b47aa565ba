use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Marker codes used by the codestream layer (ISO/IEC 15444-1, Annex A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum MarkerCode {
    /// SOC: Start of codestream.
    StartOfCodestream = 0xFF4F,
    /// SIZ: Image and tile size.
    ImageAndTileSize = 0xFF51,
    /// COD: Coding style default.
    CodingStyleDefault = 0xFF52,
    /// COC: Coding style component.
    CodingStyleComponent = 0xFF53,
    /// TLM: Tile-part lengths.
    TilePartLengths = 0xFF55,
    /// PLM: Packet lengths, main header.
    PacketLengthsMain = 0xFF57,
    /// PLT: Packet lengths, tile-part header.
    PacketLengthsTilePart = 0xFF58,
    /// QCD: Quantization default.
    QuantizationDefault = 0xFF5C,
    /// QCC: Quantization component.
    QuantizationComponent = 0xFF5D,
    /// RGN: Region of interest.
    RegionOfInterest = 0xFF5E,
    /// POC: Progression order change.
    ProgressionOrderChange = 0xFF5F,
    /// COM: Comment.
    Comment = 0xFF64,
    /// SOT: Start of tile-part.
    StartOfTile = 0xFF90,
    /// SOP: Start of packet.
    StartOfPacket = 0xFF91,
    /// EPH: End of packet header.
    EndOfPacketHeader = 0xFF92,
    /// SOD: Start of data.
    StartOfData = 0xFF93,
    /// EOC: End of codestream.
    EndOfCodestream = 0xFFD9,
    /// Reserved code terminating an unfinished fragment; the resume trailer follows it.
    FragmentEnd = 0xFF3F,
}

impl MarkerCode {
    pub fn to_bytes(self) -> [u8; 2] {
        u16::from(self).to_be_bytes()
    }

    /// Markers in the range 0xFF30..=0xFF3F carry no segment.
    pub fn has_segment(self) -> bool {
        !matches!(
            self,
            Self::StartOfCodestream
                | Self::StartOfData
                | Self::EndOfPacketHeader
                | Self::EndOfCodestream
                | Self::FragmentEnd
        )
    }
}

/// True if the two bytes could start a marker inside packet data. Codeword bytes never
/// produce an 0xFF followed by a value above 0x8F.
pub fn is_marker_pair(first: u8, second: u8) -> bool {
    first == 0xFF && second > 0x8F
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_roundtrip() {
        let m = MarkerCode::try_from(0xFF91u16).unwrap();
        assert_eq!(m, MarkerCode::StartOfPacket);
        assert_eq!(m.to_bytes(), [0xFF, 0x91]);
        assert!(MarkerCode::try_from(0xFF00u16).is_err());
    }

    #[test]
    fn test_marker_pair_detection() {
        assert!(is_marker_pair(0xFF, 0x91));
        assert!(!is_marker_pair(0xFF, 0x7F));
        assert!(!is_marker_pair(0xFE, 0x91));
    }
}

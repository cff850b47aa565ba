//! Profile-relaxation bookkeeping.
//!
//! Profile violations never abort coding. Each cause is logged once per codestream and
//! recorded so that callers can tell which restrictions were relaxed.

use log::warn;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileCause {
    BlockSizeAboveProfile,
    PrecinctSmallerThanBlock,
    TilePartInterruption,
    MissingPacketLengths,
    NonMallatDecomposition,
}

impl ProfileCause {
    pub const ALL: [ProfileCause; 5] = [
        Self::BlockSizeAboveProfile,
        Self::PrecinctSmallerThanBlock,
        Self::TilePartInterruption,
        Self::MissingPacketLengths,
        Self::NonMallatDecomposition,
    ];

    pub fn code(self) -> u16 {
        match self {
            Self::BlockSizeAboveProfile => 201,
            Self::PrecinctSmallerThanBlock => 202,
            Self::TilePartInterruption => 203,
            Self::MissingPacketLengths => 204,
            Self::NonMallatDecomposition => 205,
        }
    }

    fn bit(self) -> u32 {
        1 << (self.code() - 201)
    }

    fn message(self) -> &'static str {
        match self {
            Self::BlockSizeAboveProfile => "code-block dimensions exceed 64",
            Self::PrecinctSmallerThanBlock => "precincts smaller than the nominal code-block",
            Self::TilePartInterruption => "tile-parts closed early while precincts were pending",
            Self::MissingPacketLengths => "persistent access requested without PLT segments",
            Self::NonMallatDecomposition => {
                "non-Mallat decomposition cannot be described by COD; supply it out of band"
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ProfileMonitor {
    relaxed: AtomicU32,
}

impl ProfileMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `cause`. Returns true the first time it is seen.
    pub fn note(&self, cause: ProfileCause) -> bool {
        let prior = self.relaxed.fetch_or(cause.bit(), Ordering::AcqRel);
        let first = prior & cause.bit() == 0;
        if first {
            warn!("profile relaxed (code {}): {}", cause.code(), cause.message());
        }
        first
    }

    pub fn is_relaxed(&self, cause: ProfileCause) -> bool {
        self.relaxed.load(Ordering::Acquire) & cause.bit() != 0
    }

    pub fn relaxed_causes(&self) -> Vec<ProfileCause> {
        ProfileCause::ALL
            .into_iter()
            .filter(|&c| self.is_relaxed(c))
            .collect()
    }
}

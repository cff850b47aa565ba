//! Precincts, their tagged references and the per-tile arena that owns them.

use crate::error::J2kError;
use crate::jpeg2000::code_block::CodeBlock;
use crate::jpeg2000::geometry::{Coords, Rect};
use crate::jpeg2000::packet::HeaderState;
use crate::jpeg2000::precinct_server::SizeClassKey;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PrecinctFlags: u16 {
        /// Inside the region, resolutions and layers the application asked for.
        const RELEVANT = 1;
        /// Its packets can be found again from a recorded address.
        const ADDRESSABLE = 1 << 1;
        /// Every packet of the precinct has been parsed.
        const READ = 1 << 2;
        /// Code-block data is held in memory.
        const LOADED = 1 << 3;
        /// At least one layer has been finalized for output.
        const GENERATING = 1 << 4;
        /// Some code-block contributed coded data.
        const SIGNIFICANT = 1 << 5;
        /// The precinct holds no code-blocks.
        const NO_CONTRIBUTION = 1 << 6;
        /// Closed by the application, kept until the memory budget is exceeded.
        const INACTIVE = 1 << 7;
        const CORRUPTED = 1 << 8;
    }
}

/// Slot of a materialized precinct. The generation guards against stale references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrecinctId {
    pub slot: u32,
    pub generation: u32,
}

/// What a [`PrecinctRef`] currently says about its precinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecinctRefState {
    Unallocated,
    Active(PrecinctId),
    Closed {
        address: Option<u64>,
        was_read: bool,
        has_data: bool,
    },
}

const CLOSED_BIT: u64 = 1;
const WAS_READ_BIT: u64 = 1 << 1;
const HAS_DATA_BIT: u64 = 1 << 2;
const ADDRESS_SHIFT: u32 = 3;
const MAXIMUM_SLOT: u32 = (1 << 31) - 2;

/// One machine word per precinct position: an arena handle, or the address and flags of
/// a precinct that has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PrecinctRef(u64);

impl PrecinctRef {
    pub const UNALLOCATED: Self = Self(0);

    pub fn active(id: PrecinctId) -> Self {
        Self(((id.generation as u64) << 32) | (((id.slot as u64) + 1) << 1))
    }

    /// Addresses are codestream offsets; offset 0 holds SOC and never starts a packet.
    pub fn closed(address: Option<u64>, was_read: bool, has_data: bool) -> Self {
        let mut v = CLOSED_BIT | (address.unwrap_or(0) << ADDRESS_SHIFT);
        if was_read {
            v |= WAS_READ_BIT;
        }
        if has_data {
            v |= HAS_DATA_BIT;
        }
        Self(v)
    }

    pub fn state(self) -> PrecinctRefState {
        if self.0 == 0 {
            PrecinctRefState::Unallocated
        } else if self.0 & CLOSED_BIT != 0 {
            let address = self.0 >> ADDRESS_SHIFT;
            PrecinctRefState::Closed {
                address: (address != 0).then_some(address),
                was_read: self.0 & WAS_READ_BIT != 0,
                has_data: self.0 & HAS_DATA_BIT != 0,
            }
        } else {
            PrecinctRefState::Active(PrecinctId {
                slot: ((self.0 as u32) >> 1) - 1,
                generation: (self.0 >> 32) as u32,
            })
        }
    }

    pub fn active_id(self) -> Option<PrecinctId> {
        match self.state() {
            PrecinctRefState::Active(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_unallocated(self) -> bool {
        self.0 == 0
    }
}

/// Code-blocks of one subband inside a precinct.
#[derive(Debug, Clone, Default)]
pub struct PrecinctBand {
    pub band: usize,
    /// Block indices, in band block coordinates.
    pub blocks: Rect,
    /// Position of the first of these blocks in [`PrecinctStorage::blocks`].
    pub first: usize,
    pub max_passes: u16,
}

impl PrecinctBand {
    pub fn len(&self) -> usize {
        self.blocks.area() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.blocks.width() as usize, self.blocks.height() as usize)
    }
}

/// Recyclable memory of a precinct, sized by its [`SizeClassKey`].
#[derive(Debug, Default)]
pub struct PrecinctStorage {
    pub key: SizeClassKey,
    pub bands: Vec<PrecinctBand>,
    pub blocks: Vec<CodeBlock>,
    /// Packet length of each finalized layer.
    pub layer_bytes: Vec<u64>,
}

impl PrecinctStorage {
    pub fn new(key: SizeClassKey) -> Self {
        Self {
            key,
            bands: Vec::with_capacity(key.num_bands as usize),
            blocks: Vec::with_capacity(key.max_blocks as usize),
            layer_bytes: Vec::with_capacity(key.num_layers as usize),
        }
    }

    /// Clears content, keeping allocations.
    pub fn reset(&mut self) {
        self.bands.clear();
        self.blocks.clear();
        self.layer_bytes.clear();
    }

    pub fn block_slot(&self, band: usize, block: Coords) -> Option<usize> {
        let b = self.bands.iter().find(|b| b.band == band)?;
        if !b.blocks.contains(block) {
            return None;
        }
        Some(b.first + b.blocks.raster_index(block))
    }

    pub fn footprint(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.bands.capacity() * std::mem::size_of::<PrecinctBand>()
            + self.blocks.iter().map(CodeBlock::footprint).sum::<usize>()
            + self.layer_bytes.capacity() * 8
    }
}

#[derive(Debug)]
pub struct Precinct {
    pub storage: Box<PrecinctStorage>,
    pub component: usize,
    pub resolution: usize,
    pub position: Coords,
    pub unique_id: u64,
    pub address: Option<u64>,
    pub flags: PrecinctFlags,
    pub outstanding_blocks: AtomicU32,
    /// Layers finalized for output, or parsed from input.
    pub finalized_layers: u16,
    /// Next layer to be written.
    pub next_layer: u16,
    /// Header state as of the last finalized layer; simulations work on clones.
    pub sim_state: HeaderState,
    /// Header state of the packets actually written or parsed.
    pub out_state: HeaderState,
}

impl Precinct {
    pub fn outstanding(&self) -> u32 {
        self.outstanding_blocks.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.outstanding() == 0
    }

    /// Marks one more code-block as stored; returns the remaining count. Fails when no
    /// block is outstanding, as for a precinct materialized for input.
    pub fn block_stored(&self) -> Result<u32, J2kError> {
        self.outstanding_blocks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .map_err(|_| J2kError::InvalidOperation("code-block stored into a complete precinct"))
    }

    pub fn footprint(&self) -> usize {
        std::mem::size_of::<Self>() + self.storage.footprint()
    }
}

struct ArenaSlot {
    generation: u32,
    precinct: Option<Precinct>,
}

/// Owner of a tile's materialized precincts.
#[derive(Default)]
pub struct PrecinctArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
    live: usize,
}

impl PrecinctArena {
    pub fn insert(&mut self, precinct: Precinct) -> Result<PrecinctId, J2kError> {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            let s = &mut self.slots[slot as usize];
            s.generation = s.generation.wrapping_add(1);
            s.precinct = Some(precinct);
            return Ok(PrecinctId {
                slot,
                generation: s.generation,
            });
        }
        if self.slots.len() as u64 > MAXIMUM_SLOT as u64 {
            self.live -= 1;
            return Err(J2kError::TooManyPrecincts(format!(
                "{} live precincts in one tile",
                self.slots.len()
            )));
        }
        self.slots.push(ArenaSlot {
            generation: 0,
            precinct: Some(precinct),
        });
        Ok(PrecinctId {
            slot: self.slots.len() as u32 - 1,
            generation: 0,
        })
    }

    pub fn get(&self, id: PrecinctId) -> Option<&Precinct> {
        let s = self.slots.get(id.slot as usize)?;
        if s.generation != id.generation {
            return None;
        }
        s.precinct.as_ref()
    }

    pub fn get_mut(&mut self, id: PrecinctId) -> Option<&mut Precinct> {
        let s = self.slots.get_mut(id.slot as usize)?;
        if s.generation != id.generation {
            return None;
        }
        s.precinct.as_mut()
    }

    pub fn remove(&mut self, id: PrecinctId) -> Option<Precinct> {
        let s = self.slots.get_mut(id.slot as usize)?;
        if s.generation != id.generation {
            return None;
        }
        let p = s.precinct.take()?;
        self.free.push(id.slot);
        self.live -= 1;
        Some(p)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn ids(&self) -> Vec<PrecinctId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.precinct.is_some())
            .map(|(i, s)| PrecinctId {
                slot: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Precinct> {
        self.slots.iter().filter_map(|s| s.precinct.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Precinct> {
        self.slots.iter_mut().filter_map(|s| s.precinct.as_mut())
    }

    pub fn drain(&mut self) -> Vec<Precinct> {
        let out: Vec<Precinct> = self.slots.iter_mut().filter_map(|s| s.precinct.take()).collect();
        self.slots.clear();
        self.free.clear();
        self.live = 0;
        out
    }
}

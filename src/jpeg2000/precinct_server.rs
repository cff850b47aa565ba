//! Recycling allocator for precinct storage, shared by every tile of a codestream.
//!
//! Storage is grouped by [`SizeClassKey`]. Two lock-protected contexts are kept apart so
//! that tile construction and precinct materialization do not contend. A release that
//! finds its context busy goes to a lock-free overflow list. An allocation that misses in
//! its own context drains that list and then looks in the other context, so storage
//! released under one context is reclaimed under the other.

use crate::jpeg2000::geometry::Coords;
use crate::jpeg2000::precinct::{PrecinctId, PrecinctStorage};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, TryLockError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SizeClassKey {
    pub max_blocks: u32,
    pub num_bands: u16,
    pub num_layers: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocContext {
    General,
    Precinct,
}

impl AllocContext {
    fn other(self) -> Self {
        match self {
            Self::General => Self::Precinct,
            Self::Precinct => Self::General,
        }
    }
}

#[derive(Default)]
struct FreeLists {
    classes: HashMap<SizeClassKey, Vec<Box<PrecinctStorage>>>,
}

impl FreeLists {
    fn push(&mut self, mut storage: Box<PrecinctStorage>) {
        storage.reset();
        self.classes.entry(storage.key).or_default().push(storage);
    }

    fn pop(&mut self, key: SizeClassKey) -> Option<Box<PrecinctStorage>> {
        self.classes.get_mut(&key)?.pop()
    }
}

struct OverflowNode {
    storage: Box<PrecinctStorage>,
    context: AllocContext,
    next: *mut OverflowNode,
}

/// A closed precinct waiting for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InactiveEntry {
    pub tile: u32,
    pub component: usize,
    pub resolution: usize,
    pub position: Coords,
    pub id: PrecinctId,
    pub bytes: usize,
}

#[derive(Default)]
struct InactiveList {
    entries: VecDeque<InactiveEntry>,
    bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStats {
    pub allocated: usize,
    pub recycled: usize,
    pub overflowed: usize,
}

pub struct PrecinctServer {
    general: Mutex<FreeLists>,
    precinct: Mutex<FreeLists>,
    overflow: AtomicPtr<OverflowNode>,
    next_unique_id: AtomicU64,
    inactive: Mutex<InactiveList>,
    allocated: AtomicUsize,
    recycled: AtomicUsize,
    overflowed: AtomicUsize,
}

// The overflow list only ever holds owned boxes of `Send` data.
unsafe impl Send for PrecinctServer {}
unsafe impl Sync for PrecinctServer {}

impl Default for PrecinctServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PrecinctServer {
    pub fn new() -> Self {
        Self {
            general: Mutex::default(),
            precinct: Mutex::default(),
            overflow: AtomicPtr::new(ptr::null_mut()),
            next_unique_id: AtomicU64::new(0),
            inactive: Mutex::default(),
            allocated: AtomicUsize::new(0),
            recycled: AtomicUsize::new(0),
            overflowed: AtomicUsize::new(0),
        }
    }

    fn lists(&self, ctx: AllocContext) -> &Mutex<FreeLists> {
        match ctx {
            AllocContext::General => &self.general,
            AllocContext::Precinct => &self.precinct,
        }
    }

    /// Hands out storage of class `key`. A miss in `ctx` is served from the overflow
    /// chain, then from the other context if it is free, whichever context released it.
    pub fn allocate(&self, ctx: AllocContext, key: SizeClassKey) -> Box<PrecinctStorage> {
        let own = match self.lists(ctx).lock() {
            Ok(mut g) => g.pop(key),
            Err(poisoned) => poisoned.into_inner().pop(key),
        };
        let reclaimed = own
            .or_else(|| self.drain_overflow(key))
            .or_else(|| match self.lists(ctx.other()).try_lock() {
                Ok(mut g) => g.pop(key),
                Err(_) => None,
            });
        if let Some(storage) = reclaimed {
            self.recycled.fetch_add(1, Ordering::Relaxed);
            return storage;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Box::new(PrecinctStorage::new(key))
    }

    pub fn release(&self, ctx: AllocContext, storage: Box<PrecinctStorage>) {
        match self.lists(ctx).try_lock() {
            Ok(mut lists) => lists.push(storage),
            Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => {
                self.push_overflow(ctx, storage)
            }
        }
    }

    fn push_overflow(&self, context: AllocContext, storage: Box<PrecinctStorage>) {
        self.overflowed.fetch_add(1, Ordering::Relaxed);
        self.link_overflow(context, storage);
    }

    fn link_overflow(&self, context: AllocContext, storage: Box<PrecinctStorage>) {
        let node = Box::into_raw(Box::new(OverflowNode {
            storage,
            context,
            next: ptr::null_mut(),
        }));
        let mut head = self.overflow.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` came from Box::into_raw and is not shared until the CAS succeeds.
            unsafe { (*node).next = head };
            match self
                .overflow
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Empties the overflow chain. The first block of class `wanted` is returned; every
    /// other block goes back to the context that released it, or stays on the chain
    /// while that context is busy.
    fn drain_overflow(&self, wanted: SizeClassKey) -> Option<Box<PrecinctStorage>> {
        let mut node = self.overflow.swap(ptr::null_mut(), Ordering::Acquire);
        let mut found = None;
        while !node.is_null() {
            // SAFETY: the swap gave this thread exclusive ownership of the whole chain.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
            let OverflowNode {
                mut storage,
                context,
                ..
            } = *boxed;
            if found.is_none() && storage.key == wanted {
                storage.reset();
                found = Some(storage);
                continue;
            }
            match self.lists(context).try_lock() {
                Ok(mut lists) => lists.push(storage),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().push(storage),
                Err(TryLockError::WouldBlock) => self.link_overflow(context, storage),
            }
        }
        found
    }

    pub fn next_unique_id(&self) -> u64 {
        self.next_unique_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
        }
    }

    pub fn push_inactive(&self, entry: InactiveEntry) {
        let mut list = match self.inactive.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        list.bytes += entry.bytes;
        list.entries.push_back(entry);
    }

    /// Oldest inactive entry, if the inactive bytes exceed `budget`.
    pub fn pop_inactive_over_budget(&self, budget: usize) -> Option<InactiveEntry> {
        let mut list = match self.inactive.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if list.bytes <= budget {
            return None;
        }
        let entry = list.entries.pop_front()?;
        list.bytes = list.bytes.saturating_sub(entry.bytes);
        debug!(
            "evicting precinct {:?} of tile {} ({} inactive bytes left)",
            entry.position, entry.tile, list.bytes
        );
        Some(entry)
    }

    /// Forgets inactive entries of a released tile.
    pub fn drop_inactive_tile(&self, tile: u32) {
        let mut list = match self.inactive.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut freed = 0;
        list.entries.retain(|e| {
            let keep = e.tile != tile;
            if !keep {
                freed += e.bytes;
            }
            keep
        });
        list.bytes = list.bytes.saturating_sub(freed);
    }

    pub fn inactive_bytes(&self) -> usize {
        match self.inactive.lock() {
            Ok(g) => g.bytes,
            Err(poisoned) => poisoned.into_inner().bytes,
        }
    }
}

impl Drop for PrecinctServer {
    fn drop(&mut self) {
        let mut node = *self.overflow.get_mut();
        while !node.is_null() {
            // SAFETY: `&mut self` means no other thread can touch the list.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn key(blocks: u32) -> SizeClassKey {
        SizeClassKey {
            max_blocks: blocks,
            num_bands: 3,
            num_layers: 2,
        }
    }

    #[test]
    fn test_recycles_by_size_class() {
        let server = PrecinctServer::new();
        let a = server.allocate(AllocContext::Precinct, key(4));
        server.release(AllocContext::Precinct, a);
        let _b = server.allocate(AllocContext::Precinct, key(8));
        let _c = server.allocate(AllocContext::Precinct, key(4));
        let stats = server.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.recycled, 1);
    }

    #[test]
    fn test_busy_release_goes_to_overflow() {
        let server = PrecinctServer::new();
        let a = server.allocate(AllocContext::General, key(4));
        {
            let _held = server.general.lock().unwrap();
            server.release(AllocContext::General, a);
        }
        assert_eq!(server.stats().overflowed, 1);
        let _again = server.allocate(AllocContext::General, key(4));
        assert_eq!(server.stats().recycled, 1);
    }

    #[test]
    fn test_reclaims_across_contexts() {
        let server = PrecinctServer::new();
        let a = server.allocate(AllocContext::Precinct, key(4));
        server.release(AllocContext::General, a);
        let _b = server.allocate(AllocContext::Precinct, key(4));
        let stats = server.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.recycled, 1);
    }

    #[test]
    fn test_overflow_from_busy_context_serves_other_context() {
        let server = PrecinctServer::new();
        let a = server.allocate(AllocContext::General, key(4));
        let b = server.allocate(AllocContext::General, key(8));
        {
            let _held = server.general.lock().unwrap();
            server.release(AllocContext::General, a);
            server.release(AllocContext::General, b);
            assert_eq!(server.stats().overflowed, 2);
            // The busy General list is never waited on.
            let _c = server.allocate(AllocContext::Precinct, key(4));
        }
        assert_eq!(server.stats().recycled, 1);
        // The unmatched block went back to General.
        let _d = server.allocate(AllocContext::General, key(8));
        let stats = server.stats();
        assert_eq!(stats.recycled, 2);
        assert_eq!(stats.allocated, 2);
    }

    #[test]
    fn test_concurrent_release() {
        let server = Arc::new(PrecinctServer::new());
        thread::scope(|s| {
            for _ in 0..4 {
                let server = Arc::clone(&server);
                s.spawn(move || {
                    for _ in 0..100 {
                        let st = server.allocate(AllocContext::Precinct, key(2));
                        server.release(AllocContext::Precinct, st);
                    }
                });
            }
        });
        let stats = server.stats();
        assert_eq!(stats.allocated + stats.recycled, 400);
        assert!(stats.allocated >= 1);
    }

    #[test]
    fn test_inactive_budget() {
        let server = PrecinctServer::new();
        let entry = |tile, bytes| InactiveEntry {
            tile,
            component: 0,
            resolution: 0,
            position: Coords::new(0, 0),
            id: PrecinctId {
                slot: 0,
                generation: 0,
            },
            bytes,
        };
        server.push_inactive(entry(0, 100));
        server.push_inactive(entry(1, 100));
        assert!(server.pop_inactive_over_budget(250).is_none());
        assert_eq!(server.pop_inactive_over_budget(150).map(|e| e.tile), Some(0));
        server.drop_inactive_tile(1);
        assert_eq!(server.inactive_bytes(), 0);
    }
}

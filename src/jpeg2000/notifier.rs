//! Background block-availability notification.
//!
//! Each subband of a resolution keeps one atomic word: a 2-bit attachment state, closure
//! flags and the number of code-block rows available from the top of the band. Rows
//! become available in order as their blocks are stored; every advance is delivered to
//! an attached [`DependencyQueue`] as a dependency decrement, and closure is delivered
//! exactly once when the whole band is available.

use log::trace;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Consumer of availability events, typically a scheduler waiting on subband rows.
pub trait DependencyQueue: Send + Sync {
    fn update_dependencies(&self, band: usize, delta: i32);
    fn band_closed(&self, band: usize);
}

const STATE_MASK: u64 = 0b11;
const DETACHED: u64 = 0;
const ATTACHED: u64 = 1;
const DETACH_REQUESTED: u64 = 2;
const CLOSURE_PENDING: u64 = 1 << 2;
const CLOSURE_SENT: u64 = 1 << 3;
const ROWS_SHIFT: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundStatus {
    /// No consumer attached.
    Idle,
    /// A detach request is waiting for in-flight deliveries to finish.
    DetachPending,
    /// A detach request was acknowledged by this call.
    Detached,
    Attached,
}

struct BandAvailability {
    state: AtomicU64,
    total_rows: u32,
    row_remaining: Box<[AtomicU32]>,
    postponed: AtomicU32,
}

impl BandAvailability {
    fn rows(state: u64) -> u32 {
        (state >> ROWS_SHIFT) as u32
    }
}

pub struct ResolutionNotifier {
    bands: Vec<BandAvailability>,
    blocking: AtomicU32,
    queue: RwLock<Option<Arc<dyn DependencyQueue>>>,
}

impl std::fmt::Debug for ResolutionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionNotifier")
            .field("bands", &self.bands.len())
            .field("blocking", &self.blocking.load(Ordering::Relaxed))
            .finish()
    }
}

impl ResolutionNotifier {
    /// `bands[b]` lists the number of code-blocks in each block row of subband `b`.
    pub fn new(bands: &[Vec<u32>]) -> Self {
        let bands = bands
            .iter()
            .map(|rows| {
                let total_rows = rows.len() as u32;
                let mut initial = 0u64;
                // Rows without blocks are available from the start.
                let mut avail = 0;
                while avail < rows.len() && rows[avail] == 0 {
                    avail += 1;
                }
                initial |= (avail as u64) << ROWS_SHIFT;
                if avail == rows.len() {
                    initial |= CLOSURE_PENDING;
                }
                BandAvailability {
                    state: AtomicU64::new(initial),
                    total_rows,
                    row_remaining: rows.iter().map(|&n| AtomicU32::new(n)).collect(),
                    postponed: AtomicU32::new(0),
                }
            })
            .collect();
        Self {
            bands,
            blocking: AtomicU32::new(0),
            queue: RwLock::new(None),
        }
    }

    pub fn num_bands(&self) -> usize {
        self.bands.len()
    }

    pub fn available_rows(&self, band: usize) -> u32 {
        self.bands
            .get(band)
            .map(|b| BandAvailability::rows(b.state.load(Ordering::Acquire)))
            .unwrap_or(0)
    }

    pub fn total_rows(&self, band: usize) -> u32 {
        self.bands.get(band).map(|b| b.total_rows).unwrap_or(0)
    }

    pub fn closure_sent(&self, band: usize) -> bool {
        self.bands
            .get(band)
            .is_some_and(|b| b.state.load(Ordering::Acquire) & CLOSURE_SENT != 0)
    }

    /// Attaches `queue` and returns the rows already available in each band. Closures
    /// that became due while detached are delivered now.
    pub fn attach(&self, queue: Arc<dyn DependencyQueue>) -> Vec<u32> {
        if let Ok(mut slot) = self.queue.write() {
            *slot = Some(queue);
        }
        let mut available = Vec::with_capacity(self.bands.len());
        for band in &self.bands {
            let mut s = band.state.load(Ordering::Acquire);
            loop {
                let ns = (s & !STATE_MASK) | ATTACHED;
                match band
                    .state
                    .compare_exchange_weak(s, ns, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => break,
                    Err(actual) => s = actual,
                }
            }
            band.postponed.store(0, Ordering::Release);
            available.push(BandAvailability::rows(s));
        }
        self.sweep_closures();
        available
    }

    /// Signals that the consumer wants to go away. Deliveries are postponed from now on;
    /// [`ResolutionNotifier::background_process`] acknowledges the request.
    pub fn request_detach(&self) {
        for band in &self.bands {
            let mut s = band.state.load(Ordering::Acquire);
            while s & STATE_MASK == ATTACHED {
                let ns = (s & !STATE_MASK) | DETACH_REQUESTED;
                match band
                    .state
                    .compare_exchange_weak(s, ns, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => break,
                    Err(actual) => s = actual,
                }
            }
        }
    }

    /// Records that one code-block in `row` of `band` is complete.
    pub fn block_done(&self, band: usize, row: u32) {
        let Some(b) = self.bands.get(band) else {
            return;
        };
        let Some(counter) = b.row_remaining.get(row as usize) else {
            return;
        };
        let prev = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if prev != Ok(1) {
            return;
        }

        self.blocking.fetch_add(1, Ordering::AcqRel);
        let advanced = self.advance(b);
        if advanced > 0 {
            self.deliver(band, advanced);
        }
        if self.blocking.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.sweep_closures();
        }
    }

    fn advance(&self, b: &BandAvailability) -> u32 {
        let mut s = b.state.load(Ordering::Acquire);
        loop {
            let avail = BandAvailability::rows(s);
            let mut new = avail;
            while new < b.total_rows && b.row_remaining[new as usize].load(Ordering::SeqCst) == 0
            {
                new += 1;
            }
            if new == avail {
                return 0;
            }
            let mut ns = (s & u32::MAX as u64) | ((new as u64) << ROWS_SHIFT);
            if new == b.total_rows {
                ns |= CLOSURE_PENDING;
            }
            match b
                .state
                .compare_exchange_weak(s, ns, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return new - avail,
                Err(actual) => s = actual,
            }
        }
    }

    fn current_queue(&self) -> Option<Arc<dyn DependencyQueue>> {
        self.queue.read().ok().and_then(|q| q.clone())
    }

    /// Callers hold `blocking`, so a detach cannot be acknowledged until they return.
    fn deliver(&self, band: usize, rows: u32) {
        let b = &self.bands[band];
        // The state is read after the queue so a detach requested meanwhile is seen.
        let queue = self.current_queue();
        match (b.state.load(Ordering::Acquire) & STATE_MASK, queue) {
            (ATTACHED, Some(q)) => {
                trace!("band {band}: {rows} rows available");
                q.update_dependencies(band, -(rows as i32));
            }
            (DETACH_REQUESTED, _) => {
                b.postponed.fetch_add(rows, Ordering::AcqRel);
            }
            _ => {}
        }
    }

    fn sweep_closures(&self) {
        for band in 0..self.bands.len() {
            self.try_send_closure(band);
        }
    }

    fn try_send_closure(&self, band: usize) {
        let b = &self.bands[band];
        let mut s = b.state.load(Ordering::Acquire);
        loop {
            if s & CLOSURE_PENDING == 0 || s & CLOSURE_SENT != 0 {
                return;
            }
            // Deferred until no delivery is in flight and a consumer is attached.
            if s & STATE_MASK != ATTACHED || self.blocking.load(Ordering::Acquire) > 0 {
                return;
            }
            let ns = (s & !CLOSURE_PENDING) | CLOSURE_SENT;
            match b
                .state
                .compare_exchange_weak(s, ns, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if let Some(q) = self.current_queue() {
                        trace!("band {band}: closed");
                        q.band_closed(band);
                    }
                    return;
                }
                Err(actual) => s = actual,
            }
        }
    }

    /// Runs the deferred work: acknowledges a pending detach once no participant is
    /// blocking it, or delivers postponed progress to an attached consumer.
    pub fn background_process(&self) -> BackgroundStatus {
        let requested = self
            .bands
            .iter()
            .any(|b| b.state.load(Ordering::Acquire) & STATE_MASK == DETACH_REQUESTED);
        if requested {
            if self.blocking.load(Ordering::Acquire) > 0 {
                return BackgroundStatus::DetachPending;
            }
            for b in &self.bands {
                let mut s = b.state.load(Ordering::Acquire);
                while s & STATE_MASK == DETACH_REQUESTED {
                    let ns = (s & !STATE_MASK) | DETACHED;
                    match b
                        .state
                        .compare_exchange_weak(s, ns, Ordering::AcqRel, Ordering::Acquire)
                    {
                        Ok(_) => break,
                        Err(actual) => s = actual,
                    }
                }
                b.postponed.store(0, Ordering::Release);
            }
            if let Ok(mut slot) = self.queue.write() {
                *slot = None;
            }
            return BackgroundStatus::Detached;
        }

        let attached = self
            .bands
            .iter()
            .any(|b| b.state.load(Ordering::Acquire) & STATE_MASK == ATTACHED);
        if !attached {
            return BackgroundStatus::Idle;
        }
        self.blocking.fetch_add(1, Ordering::AcqRel);
        for (band, b) in self.bands.iter().enumerate() {
            let rows = b.postponed.swap(0, Ordering::AcqRel);
            if rows > 0 {
                self.deliver(band, rows);
            }
        }
        self.blocking.fetch_sub(1, Ordering::AcqRel);
        self.sweep_closures();
        BackgroundStatus::Attached
    }
}

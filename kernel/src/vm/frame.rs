//! The frame table: every user page that currently occupies physical memory,
//! and the clock that picks which one to give up when memory runs out.

use super::{PageTables, Pid, SwapStore, VmError};
use crate::mem::{FrameNumber, UserPool};
use crate::pagedir::PageMapper;
use crate::sync::Mutex;
use alloc::{sync::Arc, vec::Vec};
use log::{debug, trace, warn};

/// A resident user page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kpage: FrameNumber,
    pub owner: Pid,
    pub upage: usize,
    /// Pinned frames are never chosen for eviction.
    pub pinned: bool,
}

/// Resident frames in the order they were registered, with the clock hand
/// pointing at the next one to examine.
#[derive(Default)]
struct Ring {
    frames: Vec<Frame>,
    hand: usize,
}

impl Ring {
    fn position(&self, kpage: FrameNumber) -> Option<usize> {
        self.frames.iter().position(|frame| frame.kpage == kpage)
    }

    /// Unlink the frame at `at`, keeping the hand on the frame it pointed to
    /// (or the one after, if that was the frame removed).
    fn remove(&mut self, at: usize) -> Frame {
        let frame = self.frames.remove(at);
        if at < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.frames.len() {
            self.hand = 0;
        }
        frame
    }

    /// Put `frame` back at `at`, where [`Self::remove`] took it from, so the
    /// clock order is unchanged.
    fn restore(&mut self, at: usize, frame: Frame) {
        let at = at.min(self.frames.len());
        self.frames.insert(at, frame);
        if at <= self.hand {
            self.hand += 1;
        }
        if self.hand >= self.frames.len() {
            self.hand = 0;
        }
    }

    /// Second-chance clock. Sweep once from the hand, clearing accessed
    /// bits and stopping at the first unpinned frame whose bit was already
    /// clear. If there is none, every candidate has now had its chance, so
    /// sweep again and take the first unpinned frame. The hand is left just
    /// past the victim.
    fn choose_victim(&mut self, mmu: &dyn PageMapper) -> Option<usize> {
        let len = self.frames.len();
        if len == 0 {
            return None;
        }
        let start = self.hand % len;
        let order = || (0..len).map(move |step| (start + step) % len);

        let victim = order()
            .find(|&at| {
                let frame = &self.frames[at];
                if frame.pinned {
                    return false;
                }
                if mmu.is_accessed(frame.owner, frame.upage) {
                    mmu.set_accessed(frame.owner, frame.upage, false);
                    return false;
                }
                true
            })
            .or_else(|| order().find(|&at| !self.frames[at].pinned))?;

        self.hand = (victim + 1) % len;
        Some(victim)
    }
}

pub struct FrameTable {
    pool: UserPool,
    mmu: Arc<dyn PageMapper>,
    pages: Arc<PageTables>,
    swap: Arc<SwapStore>,
    ring: Mutex<Ring>,
}

impl FrameTable {
    pub fn new(
        pool: UserPool,
        mmu: Arc<dyn PageMapper>,
        pages: Arc<PageTables>,
        swap: Arc<SwapStore>,
    ) -> Self {
        Self {
            pool,
            mmu,
            pages,
            swap,
            ring: Mutex::new(Ring::default()),
        }
    }

    pub fn pool(&self) -> &UserPool {
        &self.pool
    }

    pub fn mmu(&self) -> &dyn PageMapper {
        &*self.mmu
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// Number of registered frames.
    pub fn len(&self) -> usize {
        self.ring.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a physical page for `upage` of `owner`, evicting another page if
    /// the pool is empty.
    ///
    /// The frame comes back registered and pinned, so that it can't be
    /// chosen as a victim while it's being filled. Call [`Self::unpin`] once
    /// the mapping is installed.
    pub fn allocate(&self, owner: Pid, upage: usize) -> Result<FrameNumber, VmError> {
        let kpage = match self.pool.alloc() {
            Some(kpage) => kpage,
            None => {
                let (at, victim) = self.claim_victim().ok_or_else(|| {
                    warn!("frame: no frame for {upage:#x}, all pinned");
                    VmError::OutOfMemory
                })?;
                self.write_out(at, victim)?
            }
        };

        let mut ring = self.ring.lock();
        if ring.frames.try_reserve(1).is_err() {
            drop(ring);
            self.pool.free(kpage);
            return Err(VmError::OutOfMemory);
        }
        ring.frames.push(Frame {
            kpage,
            owner,
            upage,
            pinned: true,
        });

        trace!("frame: {kpage} -> process {owner} page {upage:#x}");
        Ok(kpage)
    }

    /// Unregister `kpage` and return it to the pool. The caller has already
    /// cleared any mapping to it.
    pub fn free(&self, kpage: FrameNumber) {
        let mut ring = self.ring.lock();
        if let Some(at) = ring.position(kpage) {
            ring.remove(at);
        }
        drop(ring);
        self.pool.free(kpage);
    }

    /// The frame the clock would evict next, without evicting it. Accessed
    /// bits are cleared and the hand advances as if it had been.
    pub fn select_victim(&self) -> Option<Frame> {
        let mut ring = self.ring.lock();
        let at = ring.choose_victim(self.mmu())?;
        Some(ring.frames[at])
    }

    /// Evict `kpage`: save its contents if they can't be recovered
    /// otherwise, unmap it from its owner, and unregister it. The page is
    /// not returned to the pool; the caller now owns it.
    pub fn evict(&self, kpage: FrameNumber) -> Result<FrameNumber, VmError> {
        let mut ring = self.ring.lock();
        let at = ring.position(kpage).ok_or(VmError::NoSuchPage)?;
        if ring.frames[at].pinned {
            return Err(VmError::Pinned);
        }
        let victim = ring.remove(at);
        drop(ring);
        self.write_out(at, victim)
    }

    pub fn lookup_by_physical(&self, kpage: FrameNumber) -> Option<Frame> {
        let ring = self.ring.lock();
        ring.position(kpage).map(|at| ring.frames[at])
    }

    /// Returns `false` if `kpage` isn't registered.
    pub fn pin(&self, kpage: FrameNumber) -> bool {
        self.set_pinned(kpage, true)
    }

    pub fn unpin(&self, kpage: FrameNumber) -> bool {
        self.set_pinned(kpage, false)
    }

    pub fn frames_owned_by(&self, owner: Pid) -> Vec<Frame> {
        let ring = self.ring.lock();
        ring.frames
            .iter()
            .filter(|frame| frame.owner == owner)
            .copied()
            .collect()
    }

    /// Unregister the frame mapped at `upage` of `owner`, if it's resident.
    pub fn detach(&self, owner: Pid, upage: usize) -> Option<Frame> {
        let mut ring = self.ring.lock();
        let at = ring
            .frames
            .iter()
            .position(|frame| frame.owner == owner && frame.upage == upage)?;
        Some(ring.remove(at))
    }

    /// Unregister every frame of `owner`.
    pub fn detach_owned_by(&self, owner: Pid) -> Vec<Frame> {
        let mut ring = self.ring.lock();
        let mut detached = Vec::new();
        for at in (0..ring.frames.len()).rev() {
            if ring.frames[at].owner == owner {
                detached.push(ring.remove(at));
            }
        }
        detached
    }

    /// Give up a detached frame for good. Mapped file contents are written
    /// back if they changed; anything else is dropped.
    pub fn discard(&self, frame: Frame) {
        let Frame {
            kpage,
            owner,
            upage,
            ..
        } = frame;
        if self.mmu.is_dirty(owner, upage) {
            if let Some(region) = self.pages.mapped_region(owner, upage) {
                if let Err(err) = region.write_back(&self.pool.page(kpage)) {
                    warn!("frame: lost changes to {upage:#x} of process {owner}: {err}");
                }
            }
        }
        self.mmu.clear_mapping(owner, upage);
        self.pool.free(kpage);
    }

    fn set_pinned(&self, kpage: FrameNumber, pinned: bool) -> bool {
        let mut ring = self.ring.lock();
        let Some(at) = ring.position(kpage) else {
            return false;
        };
        ring.frames[at].pinned = pinned;
        true
    }

    /// Choose a victim and unregister it in one step, so no one else can
    /// claim or pin it in between.
    fn claim_victim(&self) -> Option<(usize, Frame)> {
        let mut ring = self.ring.lock();
        let at = ring.choose_victim(self.mmu())?;
        Some((at, ring.remove(at)))
    }

    /// Save a victim unregistered from `at` and unmap it. If it can't be
    /// saved it goes back to its place in the ring and stays resident.
    fn write_out(&self, at: usize, victim: Frame) -> Result<FrameNumber, VmError> {
        let Frame {
            kpage,
            owner,
            upage,
            ..
        } = victim;

        if self.mmu.is_dirty(owner, upage) {
            if let Err(err) = self.save(owner, upage, kpage) {
                warn!("frame: can't evict {upage:#x} of process {owner}: {err}");
                self.ring.lock().restore(at, victim);
                return Err(err);
            }
        }
        self.mmu.clear_mapping(owner, upage);

        debug!("frame: evicted {upage:#x} of process {owner} from {kpage}");
        Ok(kpage)
    }

    fn save(&self, owner: Pid, upage: usize, kpage: FrameNumber) -> Result<(), VmError> {
        if let Some(region) = self.pages.mapped_region(owner, upage) {
            return region.write_back(&self.pool.page(kpage));
        }

        let slot = self.swap.swap_out(&self.pool.page(kpage))?;
        if let Err(slot) = self.pages.update_after_swap(owner, upage, slot) {
            // The owner let go of this page while it was being written.
            debug!("frame: process {owner} no longer has {upage:#x}");
            self.swap.free(slot);
        }
        Ok(())
    }
}

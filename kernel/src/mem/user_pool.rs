use super::PageFrame;
use crate::sync::{Mutex, MutexGuard};
use alloc::boxed::Box;
use bitvec::prelude::*;
use core::fmt;
use zerocopy::FromZeroes;

/// Index of a page in the user pool. This is the handle the rest of the
/// memory manager uses for a physical page.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u32);

impl FrameNumber {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "frame {}", self.0)
    }
}

struct CoreMap {
    allocated: BitVec<usize, Lsb0>,
    /// The next frame number to start searching for free frames.
    position: usize,
    in_use: usize,
}

/// The pages set aside for user processes.
///
/// Single pages are handed out next-fit. Running out is not an error here:
/// [`UserPool::alloc`] returns `None` and the frame table falls back to
/// eviction.
pub struct UserPool {
    pages: Box<[Mutex<PageFrame>]>,
    core_map: Mutex<CoreMap>,
}

impl UserPool {
    pub fn new(pages: usize) -> Self {
        Self {
            pages: (0..pages)
                .map(|_| Mutex::new(PageFrame::new_zeroed()))
                .collect(),
            core_map: Mutex::new(CoreMap {
                allocated: bitvec![usize, Lsb0; 0; pages],
                position: 0,
                in_use: 0,
            }),
        }
    }

    pub fn in_use(&self) -> usize {
        self.core_map.lock().in_use
    }

    /// Take one free page, or `None` if every page is in use.
    pub fn alloc(&self) -> Option<FrameNumber> {
        let mut core_map = self.core_map.lock();
        let total = core_map.allocated.len();
        if core_map.in_use == total {
            return None;
        }

        let start = core_map.position;
        let index = core_map.allocated[start..]
            .first_zero()
            .map(|i| i + start)
            .or_else(|| core_map.allocated[..start].first_zero())?;

        core_map.allocated.set(index, true);
        core_map.position = (index + 1) % total;
        core_map.in_use += 1;

        Some(FrameNumber(u32::try_from(index).ok()?))
    }

    /// Return a page to the pool.
    pub fn free(&self, frame: FrameNumber) {
        let mut core_map = self.core_map.lock();
        assert!(
            core_map.allocated[frame.index()],
            "double free of {frame} in user pool"
        );
        core_map.allocated.set(frame.index(), false);
        core_map.in_use -= 1;
    }

    /// Lock the contents of `frame` for reading or writing.
    pub fn page(&self, frame: FrameNumber) -> MutexGuard<PageFrame> {
        self.pages[frame.index()].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_fit_wraps_around() {
        let pool = UserPool::new(4);
        let frames: Vec<_> = (0..4).map(|_| pool.alloc().expect("free page")).collect();
        assert_eq!(frames[3], FrameNumber::new(3));
        assert_eq!(pool.alloc(), None);

        pool.free(FrameNumber::new(1));
        assert_eq!(pool.in_use(), 3);
        // The search resumes after frame 3 and wraps to the only hole.
        assert_eq!(pool.alloc(), Some(FrameNumber::new(1)));
    }

    #[test]
    fn next_fit_skips_recently_freed() {
        let pool = UserPool::new(4);
        let first = pool.alloc().expect("free page");
        pool.free(first);
        assert_eq!(pool.alloc(), Some(FrameNumber::new(1)));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let pool = UserPool::new(2);
        let frame = pool.alloc().expect("free page");
        pool.free(frame);
        pool.free(frame);
    }

    #[test]
    fn page_contents_start_zeroed() {
        let pool = UserPool::new(1);
        let frame = pool.alloc().expect("free page");
        assert!(pool.page(frame).0.iter().all(|&b| b == 0));
    }
}

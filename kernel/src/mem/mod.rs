//! Physical memory handed out to user processes.

pub mod user_pool;

pub use self::user_pool::{FrameNumber, UserPool};

use kidneyos_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};
use kidneyos_shared::sizes::SECTOR_SIZE;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// The contents of one physical page.
#[derive(FromZeroes, FromBytes, AsBytes)]
#[repr(transparent)]
pub struct PageFrame(pub [u8; PAGE_FRAME_SIZE]);

impl PageFrame {
    /// The page split into device sectors, in order.
    pub fn sectors(&self) -> impl Iterator<Item = &[u8]> {
        debug_assert_eq!(self.0.len(), SECTORS_PER_PAGE * SECTOR_SIZE as usize);
        self.as_bytes().chunks_exact(SECTOR_SIZE as usize)
    }

    pub fn sectors_mut(&mut self) -> impl Iterator<Item = &mut [u8]> {
        self.as_bytes_mut().chunks_exact_mut(SECTOR_SIZE as usize)
    }
}

//! Swap partition management.
//!
//! The swap device is carved into page-sized slots: slot `i` covers sectors
//! `[i * SECTORS_PER_PAGE, (i + 1) * SECTORS_PER_PAGE)`. Which slots are in use
//! is kept in memory only and starts out empty at every boot.

use super::VmError;
use crate::block::{Block, BlockManager, BlockSector, BlockType};
use crate::mem::PageFrame;
use crate::sync::Mutex;
use bitvec::prelude::*;
use kidneyos_shared::mem::SECTORS_PER_PAGE;
use log::{debug, info, warn};

/// An occupied swap slot.
///
/// Deliberately neither `Copy` nor `Clone`: whoever holds the value owns the
/// slot, and must give it back through [`SwapStore::swap_in`] or
/// [`SwapStore::free`].
#[derive(Debug, PartialEq, Eq)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(&self) -> usize {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sectors(&self) -> impl Iterator<Item = BlockSector> {
        // Slot count is derived from a `BlockSector` sized device, so this fits.
        let first = (self.0 * SECTORS_PER_PAGE) as BlockSector;
        first..first + SECTORS_PER_PAGE as BlockSector
    }
}

struct SwapDevice {
    block: Block,
    used: BitVec<usize, Lsb0>,
}

/// Page-granular storage on the swap-role block device.
///
/// One lock covers both the occupancy map and the device transfer, so all
/// swap I/O in the system happens one page at a time.
pub struct SwapStore {
    device: Mutex<SwapDevice>,
}

impl SwapStore {
    pub fn new(block: Block) -> Self {
        let slots = block.get_size() as usize / SECTORS_PER_PAGE;
        Self {
            device: Mutex::new(SwapDevice {
                block,
                used: bitvec![usize, Lsb0; 0; slots],
            }),
        }
    }

    /// Take ownership of the swap partition registered with `blocks`.
    pub fn init(blocks: &mut BlockManager) -> Result<Self, VmError> {
        let block = blocks
            .claim_role(BlockType::Swap)
            .ok_or(VmError::NoSwapDevice)?;
        let swap = Self::new(block);
        info!("swap: {} slots", swap.slots());
        Ok(swap)
    }

    pub fn slots(&self) -> usize {
        self.device.lock().used.len()
    }

    pub fn used_slots(&self) -> usize {
        self.device.lock().used.count_ones()
    }

    /// Write `page` to the first free slot.
    pub fn swap_out(&self, page: &PageFrame) -> Result<SwapSlot, VmError> {
        let mut device = self.device.lock();
        let Some(index) = device.used.first_zero() else {
            warn!("swap: out of slots");
            return Err(VmError::SwapFull);
        };

        let slot = SwapSlot(index);
        for (sector, data) in slot.sectors().zip(page.sectors()) {
            device.block.write(sector, data)?;
        }
        device.used.set(index, true);

        debug!("swap: wrote slot {index}");
        Ok(slot)
    }

    /// Read `slot` back into `page` and release it.
    ///
    /// The slot is released even if the device reports an error, since its
    /// contents can no longer be trusted.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut PageFrame) -> Result<(), VmError> {
        let mut device = self.device.lock();
        debug_assert!(device.used[slot.index()], "reading free swap slot");

        let mut result = Ok(());
        for (sector, data) in slot.sectors().zip(page.sectors_mut()) {
            if let Err(err) = device.block.read(sector, data) {
                result = Err(err.into());
                break;
            }
        }
        device.used.set(slot.index(), false);

        debug!("swap: read slot {}", slot.index());
        result
    }

    /// Release `slot` without reading it.
    pub fn free(&self, slot: SwapSlot) {
        let mut device = self.device.lock();
        assert!(device.used[slot.index()], "double free of swap slot {}", slot.index());
        device.used.set(slot.index(), false);
    }
}

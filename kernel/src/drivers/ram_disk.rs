use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::{vec, vec::Vec};

/// A block device kept entirely in kernel memory. Used as the swap partition
/// when no disk is attached, and by the unit tests.
pub struct RamDisk {
    sectors: Vec<[u8; BLOCK_SECTOR_SIZE]>,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            sectors: vec![[0; BLOCK_SECTOR_SIZE]; sectors as usize],
        }
    }
}

impl BlockOp for RamDisk {
    unsafe fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let data = self
            .sectors
            .get(sector as usize)
            .ok_or(BlockError::ReadError)?;
        buf.copy_from_slice(data);
        Ok(())
    }

    unsafe fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let data = self
            .sectors
            .get_mut(sector as usize)
            .ok_or(BlockError::WriteError)?;
        data.copy_from_slice(buf);
        Ok(())
    }
}

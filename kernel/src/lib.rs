#![cfg_attr(target_os = "none", no_std)]

//! Demand paging for KidneyOS user processes: a frame table with clock
//! eviction, per-process supplemental page tables, a swap partition, and the
//! page fault handler that ties them together.

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod logging;
pub mod mem;
pub mod pagedir;
pub mod sync;
pub mod user_program;
pub mod vm;

use alloc::sync::Arc;
use block::BlockManager;
use kidneyos_shared::{eprintln, println};
use pagedir::PageMapper;
use vm::{VirtualMemory, VmConfig};

/// Bring up logging and the memory manager. A malformed command line leaves
/// every option at its default. Returns `None` if there's no swap partition
/// in `blocks`.
pub fn init(cmdline: &str, mmu: Arc<dyn PageMapper>, blocks: &mut BlockManager) -> Option<VirtualMemory> {
    if logging::init().is_err() {
        eprintln!("Logger already installed");
    }

    let config = VmConfig::from_cmdline(cmdline).unwrap_or_else(|err| {
        log::warn!("{err}, using defaults");
        VmConfig::default()
    });

    println!("Setting up virtual memory");
    match VirtualMemory::new(config, mmu, blocks) {
        Ok(vm) => {
            println!("Virtual memory set up!");
            Some(vm)
        }
        Err(err) => {
            eprintln!("Virtual memory unavailable: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockType;
    use crate::drivers::ram_disk::RamDisk;
    use crate::pagedir::PageDirectories;
    use alloc::boxed::Box;

    #[test]
    fn init_from_cmdline() {
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::Swap, "hdb1", 64, Box::new(RamDisk::new(64)));

        let vm = init("-ul=12 -sl=bogus", Arc::new(PageDirectories::new()), &mut blocks)
            .expect("swap partition present");
        assert_eq!(vm.config(), &VmConfig::default());
        assert_eq!(vm.swap().slots(), 8);

        let vm = init("-ul=12", Arc::new(PageDirectories::new()), &mut blocks);
        assert!(vm.is_none());
    }
}

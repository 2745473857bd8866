//! Demand-paged virtual memory for user processes.
//!
//! Nothing is loaded when a process starts. Its pages are described in the
//! supplemental page table ([`page`]), and brought into a physical frame
//! ([`frame`]) the first time they fault. When the user pool runs dry a
//! resident page is chosen by the clock algorithm and written to the swap
//! partition ([`swap`]) or back to the file it maps.
//!
//! Three locks guard the shared state: the frame table's, the page tables',
//! and the swap store's. No code path holds two of them at once.

pub mod config;
pub mod fault;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod swap;

pub use self::config::VmConfig;
pub use self::fault::{FaultErrorCode, PageFault};
pub use self::frame::{Frame, FrameTable};
pub use self::page::{FileRegion, PageEntry, PageInfo, PageKind, PageOrigin, PageTables};
pub use self::swap::{SwapSlot, SwapStore};

use crate::block::{BlockError, BlockManager};
use crate::mem::UserPool;
use crate::pagedir::PageMapper;
use alloc::sync::Arc;
use core::fmt;
use log::{debug, info};

/// Process identifier.
pub type Pid = u16;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No free frame, and every resident frame is pinned.
    OutOfMemory,
    /// Every swap slot is occupied.
    SwapFull,
    /// No block device was registered with the swap role.
    NoSwapDevice,
    /// The backing file ended before the page was filled.
    ShortRead,
    /// The backing file could not take all of a page's contents.
    ShortWrite,
    /// The hardware page table refused the mapping.
    MapFailed,
    /// The frame or page in question is not tracked.
    NoSuchPage,
    /// The frame is pinned and can't be evicted.
    Pinned,
    /// A page is already described at that address.
    AlreadyMapped,
    /// The process has no supplemental page table.
    NoPageTable,
    /// The address is unaligned, null, or not a user address.
    BadAddress,
    Block(BlockError),
}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        Self::Block(err)
    }
}

impl fmt::Debug for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "Out of memory"),
            Self::SwapFull => write!(f, "Swap full"),
            Self::NoSwapDevice => write!(f, "No swap device"),
            Self::ShortRead => write!(f, "Short read"),
            Self::ShortWrite => write!(f, "Short write"),
            Self::MapFailed => write!(f, "Map failed"),
            Self::NoSuchPage => write!(f, "No such page"),
            Self::Pinned => write!(f, "Pinned"),
            Self::AlreadyMapped => write!(f, "Already mapped"),
            Self::NoPageTable => write!(f, "No page table"),
            Self::BadAddress => write!(f, "Bad address"),
            Self::Block(err) => write!(f, "Block({err:?})"),
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "all frames are pinned"),
            Self::SwapFull => write!(f, "swap partition is full"),
            Self::NoSwapDevice => write!(f, "no swap partition"),
            Self::ShortRead => write!(f, "backing file ended early"),
            Self::ShortWrite => write!(f, "could not write back to file"),
            Self::MapFailed => write!(f, "page table refused mapping"),
            Self::NoSuchPage => write!(f, "page is not tracked"),
            Self::Pinned => write!(f, "frame is pinned"),
            Self::AlreadyMapped => write!(f, "address is already in use"),
            Self::NoPageTable => write!(f, "process has no page table"),
            Self::BadAddress => write!(f, "bad user address"),
            Self::Block(err) => write!(f, "swap device error: {err}"),
        }
    }
}

impl core::error::Error for VmError {}

/// The memory manager: owns the frame table, the supplemental page tables,
/// and the swap store.
pub struct VirtualMemory {
    config: VmConfig,
    pages: Arc<PageTables>,
    swap: Arc<SwapStore>,
    frames: FrameTable,
}

impl VirtualMemory {
    /// Set up paging with `config.user_pages` frames, taking the swap
    /// partition out of `blocks`.
    pub fn new(
        config: VmConfig,
        mmu: Arc<dyn PageMapper>,
        blocks: &mut BlockManager,
    ) -> Result<Self, VmError> {
        let swap = Arc::new(SwapStore::init(blocks)?);
        let pages = Arc::new(PageTables::new());
        let frames = FrameTable::new(
            UserPool::new(config.user_pages),
            mmu,
            pages.clone(),
            swap.clone(),
        );
        info!(
            "vm: {} user frames, {} KB stack limit",
            config.user_pages,
            config.stack_limit / 1024
        );

        Ok(Self {
            config,
            pages,
            swap,
            frames,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn pages(&self) -> &PageTables {
        &self.pages
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// Create the (empty) supplemental page table of a new process.
    pub fn start_process(&self, pid: Pid) {
        self.pages.init(pid);
    }

    /// Bring the page containing `addr` into memory.
    pub fn load(&self, pid: Pid, addr: usize) -> bool {
        self.pages.load(pid, addr, &self.frames)
    }

    /// Release everything `pid` holds: its resident frames, writing mapped
    /// files back first, its swap slots, and its supplemental page table.
    pub fn exit_process(&self, pid: Pid) {
        let frames = self.frames.detach_owned_by(pid);
        let resident = frames.len();
        for frame in frames {
            self.frames.discard(frame);
        }
        let described = self.pages.destroy(pid, &self.swap);
        debug!("vm: process {pid} exited, released {resident} frames and {described} pages");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::block::BlockType;
    use crate::drivers::ram_disk::RamDisk;
    use crate::pagedir::PageDirectories;
    use alloc::boxed::Box;
    use kidneyos_shared::mem::SECTORS_PER_PAGE;

    /// A memory manager over `frames` user frames and `slots` swap slots,
    /// along with the page directories standing in for the MMU.
    pub fn machine(frames: usize, slots: u32) -> (VirtualMemory, Arc<PageDirectories>) {
        machine_with(frames, slots, |dirs| dirs as Arc<dyn PageMapper>)
    }

    pub fn machine_with(
        frames: usize,
        slots: u32,
        mmu: impl FnOnce(Arc<PageDirectories>) -> Arc<dyn PageMapper>,
    ) -> (VirtualMemory, Arc<PageDirectories>) {
        let mut blocks = BlockManager::new();
        let sectors = slots * SECTORS_PER_PAGE as u32;
        blocks.register_block(BlockType::Swap, "swap", sectors, Box::new(RamDisk::new(sectors)));

        let dirs = Arc::new(PageDirectories::new());
        let config = VmConfig {
            user_pages: frames,
            ..VmConfig::default()
        };
        let vm = VirtualMemory::new(config, mmu(dirs.clone()), &mut blocks)
            .expect("swap device registered");
        (vm, dirs)
    }

    /// Store `byte` at `addr` the way a user instruction would, faulting the
    /// page in first if it isn't resident.
    pub fn poke(vm: &VirtualMemory, dirs: &PageDirectories, pid: Pid, addr: usize, byte: u8) -> bool {
        let upage = kidneyos_shared::mem::pg_round_down(addr);
        if !dirs.touch(pid, addr, true) {
            let fault = PageFault {
                addr,
                user: true,
                write: true,
                not_present: true,
                esp: addr,
            };
            if !vm.handle_fault(pid, fault) || !dirs.touch(pid, addr, true) {
                return false;
            }
        }
        let Some(frame) = dirs.translate(pid, upage) else {
            return false;
        };
        vm.frames().pool().page(frame).0[addr - upage] = byte;
        true
    }

    /// Load the byte at `addr` the way a user instruction would.
    pub fn peek(vm: &VirtualMemory, dirs: &PageDirectories, pid: Pid, addr: usize) -> Option<u8> {
        let upage = kidneyos_shared::mem::pg_round_down(addr);
        if !dirs.touch(pid, addr, false) {
            let fault = PageFault {
                addr,
                user: true,
                write: false,
                not_present: true,
                esp: addr,
            };
            if !vm.handle_fault(pid, fault) || !dirs.touch(pid, addr, false) {
                return None;
            }
        }
        let frame = dirs.translate(pid, upage)?;
        let byte = vm.frames().pool().page(frame).0[addr - upage];
        Some(byte)
    }
}

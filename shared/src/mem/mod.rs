use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address. User stacks grow
// down from here.
pub const OFFSET: usize = 0x80000000;

/// Number of swap device sectors holding one page.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE as usize;

/// Default bound on how far a user stack may grow below `OFFSET`.
pub const STACK_LIMIT: usize = MB;

/// `PUSHA` touches up to 32 bytes below the stack pointer before updating it,
/// so faults that close to `esp` still count as stack accesses.
pub const STACK_SLACK: usize = 32;

/// Number of user pages handed out when the command line doesn't say.
pub const DEFAULT_USER_PAGES: usize = 256;

#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    pg_round_down(addr + PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

//! Page fault dispatch: load a described page, grow the stack, or give up.

use super::{PageOrigin, Pid, VirtualMemory};
use bitbybit::bitfield;
use kidneyos_shared::mem::{is_user_vaddr, pg_round_down, OFFSET, PAGE_FRAME_SIZE, STACK_SLACK};
use log::{debug, trace};

/// What the processor reported about a page fault.
#[derive(Clone, Copy, Debug)]
pub struct PageFault {
    /// The address that was accessed (CR2).
    pub addr: usize,
    /// The access was made in user mode.
    pub user: bool,
    pub write: bool,
    /// The page wasn't present, as opposed to a protection violation.
    pub not_present: bool,
    /// The user stack pointer when the fault happened.
    pub esp: usize,
}

/// The error code the processor pushes with a page fault.
#[bitfield(u32, default = 0)]
pub struct FaultErrorCode {
    /// Clear if the page wasn't present, set for a protection violation.
    #[bit(0, rw)]
    protection: bool,
    #[bit(1, rw)]
    write: bool,
    #[bit(2, rw)]
    user: bool,
}

impl PageFault {
    /// Decode a fault at `addr` (CR2) with the stack pointer `esp`.
    pub fn new(code: FaultErrorCode, addr: usize, esp: usize) -> Self {
        Self {
            addr,
            user: code.user(),
            write: code.write(),
            not_present: !code.protection(),
            esp,
        }
    }
}

impl VirtualMemory {
    /// Resolve a page fault taken by `pid`. Returns `true` if the access can
    /// be retried, `false` if the process should be killed.
    pub fn handle_fault(&self, pid: Pid, fault: PageFault) -> bool {
        trace!("fault: process {pid} {fault:x?}");
        if !fault.not_present || !is_user_vaddr(fault.addr) {
            debug!("fault: process {pid} rights violation at {:#x}", fault.addr);
            return false;
        }

        match self.pages.lookup(pid, fault.addr) {
            Some(info) if fault.write && !info.writable => {
                debug!("fault: process {pid} wrote read-only {:#x}", info.upage);
                false
            }
            Some(_) => self.load(pid, fault.addr),
            None if self.is_stack_access(&fault) => self.grow_stack(pid, fault.addr),
            None => {
                debug!("fault: process {pid} touched unmapped {:#x}", fault.addr);
                false
            }
        }
    }

    /// Whether `fault` looks like the user stack growing: at most
    /// `STACK_SLACK` bytes below the stack pointer and within the stack limit.
    pub fn is_stack_access(&self, fault: &PageFault) -> bool {
        fault.user
            && fault.addr >= fault.esp.saturating_sub(STACK_SLACK)
            && fault.addr >= self.stack_bottom()
            && fault.addr < OFFSET
    }

    /// Add a zeroed, writable page at `addr` to the stack of `pid` and load
    /// it.
    pub fn grow_stack(&self, pid: Pid, addr: usize) -> bool {
        if addr < self.stack_bottom() || !is_user_vaddr(addr) {
            return false;
        }
        let upage = pg_round_down(addr);
        // A concurrent fault may have described the page first.
        if !self.pages.install(pid, upage, PageOrigin::Zero, true) && self.pages.lookup(pid, upage).is_none() {
            return false;
        }
        trace!("fault: process {pid} stack grew to {upage:#x}");
        self.load(pid, upage)
    }

    /// Give a new process the top page of its stack.
    pub fn setup_stack(&self, pid: Pid) -> bool {
        self.grow_stack(pid, OFFSET - PAGE_FRAME_SIZE)
    }

    pub(super) fn stack_bottom(&self) -> usize {
        OFFSET.saturating_sub(self.config.stack_limit)
    }
}

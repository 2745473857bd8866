//! Hardware page-table access for user address spaces.
//!
//! The memory manager only ever touches page tables through [`PageMapper`]:
//! install or clear a single user mapping, query it, and read or reset its
//! accessed and dirty bits. [`PageDirectories`] implements it with x86
//! two-level tables kept per process.

// User addresses are below 2GB, and frame numbers fit in 20 bits; both
// conversions to u32 are checked before casting.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::FrameNumber;
use crate::sync::Mutex;
use crate::vm::Pid;
use alloc::{boxed::Box, collections::BTreeMap};
use arbitrary_int::{u20, Number};
use kidneyos_shared::mem::{is_user_vaddr, pg_offset};
use kidneyos_shared::paging::{PageTable, PageTableEntry, VirtualAddress};

pub trait PageMapper: Send + Sync {
    /// Map user page `upage` of `pid` to `frame`. Returns `false` if the
    /// mapping can't be installed.
    fn set_mapping(&self, pid: Pid, upage: usize, frame: FrameNumber, writable: bool) -> bool;
    /// Mark `upage` not present. Later accesses fault.
    fn clear_mapping(&self, pid: Pid, upage: usize);
    /// The frame `upage` is currently mapped to, if any.
    fn translate(&self, pid: Pid, upage: usize) -> Option<FrameNumber>;
    fn is_accessed(&self, pid: Pid, upage: usize) -> bool;
    fn set_accessed(&self, pid: Pid, upage: usize, accessed: bool);
    fn is_dirty(&self, pid: Pid, upage: usize) -> bool;
    fn set_dirty(&self, pid: Pid, upage: usize, dirty: bool);
}

#[derive(Default)]
struct PageDirectory {
    tables: BTreeMap<u16, Box<PageTable>>,
}

impl PageDirectory {
    fn entry(&self, upage: usize) -> Option<PageTableEntry> {
        let addr = VirtualAddress::from_usize(upage);
        let table = self.tables.get(&addr.page_directory_index().value())?;
        let entry = table[usize::from(addr.page_table_index().value())];
        entry.present().then_some(entry)
    }

    fn update(&mut self, upage: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        let addr = VirtualAddress::from_usize(upage);
        if let Some(table) = self.tables.get_mut(&addr.page_directory_index().value()) {
            let slot = &mut table[usize::from(addr.page_table_index().value())];
            if slot.present() {
                *slot = f(*slot);
            }
        }
    }
}

/// Software-walked page directories for every user process.
#[derive(Default)]
pub struct PageDirectories {
    directories: Mutex<BTreeMap<Pid, PageDirectory>>,
}

impl PageDirectories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the MMU performing an access to `addr` on behalf of `pid`:
    /// sets the accessed bit, and the dirty bit for writes. Returns `false`
    /// where the hardware would raise a page fault.
    pub fn touch(&self, pid: Pid, addr: usize, write: bool) -> bool {
        let upage = addr - pg_offset(addr);
        let mut directories = self.directories.lock();
        let Some(directory) = directories.get_mut(&pid) else {
            return false;
        };
        match directory.entry(upage) {
            Some(entry) if !write || entry.read_write() => {
                directory.update(upage, |entry| {
                    entry.with_accessed(true).with_dirty(entry.dirty() || write)
                });
                true
            }
            _ => false,
        }
    }

    /// Number of present user mappings of `pid`.
    pub fn mapped_pages(&self, pid: Pid) -> usize {
        self.directories.lock().get(&pid).map_or(0, |directory| {
            directory
                .tables
                .values()
                .map(|table| table.iter().filter(|entry| entry.present()).count())
                .sum()
        })
    }

    fn with_entry<R>(&self, pid: Pid, upage: usize, f: impl FnOnce(PageTableEntry) -> R) -> Option<R> {
        self.directories.lock().get(&pid)?.entry(upage).map(f)
    }

    fn update_entry(&self, pid: Pid, upage: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(directory) = self.directories.lock().get_mut(&pid) {
            directory.update(upage, f);
        }
    }
}

impl PageMapper for PageDirectories {
    fn set_mapping(&self, pid: Pid, upage: usize, frame: FrameNumber, writable: bool) -> bool {
        debug_assert_eq!(pg_offset(upage), 0);
        if !is_user_vaddr(upage) || frame.index() > u20::MAX.value() as usize {
            return false;
        }

        let addr = VirtualAddress::from_usize(upage);
        let mut directories = self.directories.lock();
        let table = directories
            .entry(pid)
            .or_default()
            .tables
            .entry(addr.page_directory_index().value())
            .or_insert_with(|| Box::new(PageTable::DEFAULT));

        let slot = &mut table[usize::from(addr.page_table_index().value())];
        if slot.present() {
            return false;
        }
        *slot = PageTableEntry::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(u20::new(frame.index() as u32));
        true
    }

    fn clear_mapping(&self, pid: Pid, upage: usize) {
        let addr = VirtualAddress::from_usize(upage);
        let mut directories = self.directories.lock();
        let Some(directory) = directories.get_mut(&pid) else {
            return;
        };
        let index = addr.page_directory_index().value();
        if let Some(table) = directory.tables.get_mut(&index) {
            table[usize::from(addr.page_table_index().value())] = PageTableEntry::DEFAULT;
            if table.is_empty() {
                directory.tables.remove(&index);
            }
        }
    }

    fn translate(&self, pid: Pid, upage: usize) -> Option<FrameNumber> {
        self.with_entry(pid, upage, |entry| {
            FrameNumber::new(entry.page_frame_address().value())
        })
    }

    fn is_accessed(&self, pid: Pid, upage: usize) -> bool {
        self.with_entry(pid, upage, |entry| entry.accessed())
            .unwrap_or(false)
    }

    fn set_accessed(&self, pid: Pid, upage: usize, accessed: bool) {
        self.update_entry(pid, upage, |entry| entry.with_accessed(accessed));
    }

    fn is_dirty(&self, pid: Pid, upage: usize) -> bool {
        self.with_entry(pid, upage, |entry| entry.dirty())
            .unwrap_or(false)
    }

    fn set_dirty(&self, pid: Pid, upage: usize, dirty: bool) {
        self.update_entry(pid, upage, |entry| entry.with_dirty(dirty));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 0x0804_8000;

    #[test]
    fn map_translate_clear() {
        let dirs = PageDirectories::new();
        assert!(dirs.set_mapping(1, PAGE, FrameNumber::new(7), true));
        assert_eq!(dirs.translate(1, PAGE), Some(FrameNumber::new(7)));
        assert_eq!(dirs.translate(2, PAGE), None);
        assert_eq!(dirs.mapped_pages(1), 1);

        dirs.clear_mapping(1, PAGE);
        assert_eq!(dirs.translate(1, PAGE), None);
        assert_eq!(dirs.mapped_pages(1), 0);
    }

    #[test]
    fn refuses_double_and_kernel_mappings() {
        let dirs = PageDirectories::new();
        assert!(dirs.set_mapping(1, PAGE, FrameNumber::new(1), false));
        assert!(!dirs.set_mapping(1, PAGE, FrameNumber::new(2), false));
        assert!(!dirs.set_mapping(1, 0x8000_0000, FrameNumber::new(2), false));
    }

    #[test]
    fn touch_sets_accessed_and_dirty() {
        let dirs = PageDirectories::new();
        assert!(dirs.set_mapping(1, PAGE, FrameNumber::new(1), true));
        assert!(!dirs.is_accessed(1, PAGE));

        assert!(dirs.touch(1, PAGE + 0x10, false));
        assert!(dirs.is_accessed(1, PAGE));
        assert!(!dirs.is_dirty(1, PAGE));

        assert!(dirs.touch(1, PAGE, true));
        assert!(dirs.is_dirty(1, PAGE));

        dirs.set_accessed(1, PAGE, false);
        dirs.set_dirty(1, PAGE, false);
        assert!(!dirs.is_accessed(1, PAGE));
        assert!(!dirs.is_dirty(1, PAGE));
    }

    #[test]
    fn touch_faults_on_read_only_write() {
        let dirs = PageDirectories::new();
        assert!(dirs.set_mapping(1, PAGE, FrameNumber::new(1), false));
        assert!(!dirs.touch(1, PAGE, true));
        assert!(!dirs.is_dirty(1, PAGE));
        assert!(!dirs.touch(1, PAGE + 0x1000, false));
    }
}

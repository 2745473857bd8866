//! Memory-mapped files.
//!
//! A mapping is a run of [`PageOrigin::Mapped`] entries, one per page of the
//! file. Pages are loaded on demand like any other, and changes go back to
//! the file when the page is evicted, unmapped, or its process exits.

use super::{FileRegion, PageOrigin, Pid, VirtualMemory, VmError};
use crate::fs::FileRef;
use core::cmp::min;
use kidneyos_shared::mem::{pg_offset, PAGE_FRAME_SIZE};
use log::debug;

impl VirtualMemory {
    /// Map all of `file` into `pid` starting at the page-aligned `addr`.
    /// Returns the number of pages the mapping spans.
    pub fn map_file(&self, pid: Pid, file: FileRef, addr: usize, writable: bool) -> Result<usize, VmError> {
        let len = usize::try_from(file.lock().len()).map_err(|_| VmError::BadAddress)?;
        if len == 0 || addr == 0 || pg_offset(addr) != 0 {
            return Err(VmError::BadAddress);
        }

        let pages = len.div_ceil(PAGE_FRAME_SIZE);
        let end = pages
            .checked_mul(PAGE_FRAME_SIZE)
            .and_then(|size| addr.checked_add(size))
            .ok_or(VmError::BadAddress)?;
        if end > self.stack_bottom() {
            return Err(VmError::BadAddress);
        }
        if !self.pages.has_table(pid) {
            return Err(VmError::NoPageTable);
        }
        if !self.pages.is_range_free(pid, addr, pages) {
            return Err(VmError::AlreadyMapped);
        }

        for index in 0..pages {
            let offset = index * PAGE_FRAME_SIZE;
            let region = FileRegion::new(file.clone(), offset as u64, min(PAGE_FRAME_SIZE, len - offset));
            if !self.pages.install(pid, addr + offset, PageOrigin::Mapped(region), writable) {
                // Lost a race with another install in the same range.
                self.unmap_file(pid, addr, index);
                return Err(VmError::AlreadyMapped);
            }
        }

        debug!("mmap: process {pid} mapped {len} bytes at {addr:#x}");
        Ok(pages)
    }

    /// Remove `pages` pages of a mapping starting at `addr`, writing changed
    /// pages back to the file.
    pub fn unmap_file(&self, pid: Pid, addr: usize, pages: usize) {
        for index in 0..pages {
            let upage = addr + index * PAGE_FRAME_SIZE;
            if let Some(frame) = self.frames.detach(pid, upage) {
                self.frames.discard(frame);
            }
            if let Some(slot) = self.pages.remove(pid, upage).and_then(|entry| entry.into_swap_slot()) {
                self.swap.free(slot);
            }
        }
        debug!("mmap: process {pid} unmapped {pages} pages at {addr:#x}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tempfs::TempFile;
    use crate::sync::Mutex;
    use crate::vm::testing::{machine, peek, poke};
    use crate::vm::PageKind;
    use alloc::{sync::Arc, vec, vec::Vec};

    const BASE: usize = 0x1000_0000;
    const PAGE: usize = PAGE_FRAME_SIZE;

    fn shared_file(data: Vec<u8>) -> (Arc<Mutex<TempFile>>, FileRef) {
        let file = Arc::new(Mutex::new(TempFile::new(data)));
        let handle: FileRef = file.clone();
        (file, handle)
    }

    #[test]
    fn pages_load_lazily() {
        let (vm, dirs) = machine(4, 4);
        let data: Vec<u8> = (0..(2 * PAGE + PAGE / 2)).map(|i| (i / PAGE) as u8 + 1).collect();
        let (_file, handle) = shared_file(data);
        vm.start_process(1);

        assert_eq!(vm.map_file(1, handle, BASE, true), Ok(3));
        assert_eq!(vm.frames().pool().in_use(), 0);
        assert_eq!(vm.pages().lookup(1, BASE + 2 * PAGE).map(|info| info.kind), Some(PageKind::Mapped));

        assert_eq!(peek(&vm, &dirs, 1, BASE), Some(1));
        assert_eq!(peek(&vm, &dirs, 1, BASE + 2 * PAGE + 10), Some(3));
        // Past the end of the file.
        assert_eq!(peek(&vm, &dirs, 1, BASE + 2 * PAGE + PAGE / 2), Some(0));
        assert_eq!(vm.frames().pool().in_use(), 2);
    }

    #[test]
    fn unmap_writes_back_changes() {
        let (vm, dirs) = machine(4, 4);
        let (file, handle) = shared_file(vec![0; PAGE + 10]);
        vm.start_process(1);
        assert_eq!(vm.map_file(1, handle, BASE, true), Ok(2));

        assert!(poke(&vm, &dirs, 1, BASE + 5, 0xaa));
        assert!(poke(&vm, &dirs, 1, BASE + PAGE + 9, 0xbb));
        // Beyond the end of the file: kept in memory, never written.
        assert!(poke(&vm, &dirs, 1, BASE + PAGE + 10, 0xcc));
        vm.unmap_file(1, BASE, 2);

        let file = file.lock();
        assert_eq!(file.contents().len(), PAGE + 10);
        assert_eq!(file.contents()[5], 0xaa);
        assert_eq!(file.contents()[PAGE + 9], 0xbb);
        drop(file);

        assert_eq!(vm.pages().lookup(1, BASE), None);
        assert!(vm.frames().is_empty());
        assert_eq!(dirs.mapped_pages(1), 0);
    }

    #[test]
    fn evicted_mapped_page_goes_to_file() {
        let (vm, dirs) = machine(1, 4);
        let (file, handle) = shared_file(vec![1; PAGE]);
        vm.start_process(1);
        assert_eq!(vm.map_file(1, handle, BASE, true), Ok(1));
        assert!(vm.pages().install(1, BASE + PAGE, PageOrigin::Zero, true));

        assert!(poke(&vm, &dirs, 1, BASE, 7));
        assert_eq!(peek(&vm, &dirs, 1, BASE + PAGE), Some(0));
        assert_eq!(vm.swap().used_slots(), 0);
        assert_eq!(file.lock().contents()[0], 7);
        assert_eq!(vm.pages().lookup(1, BASE).map(|info| info.kind), Some(PageKind::Mapped));

        assert_eq!(peek(&vm, &dirs, 1, BASE), Some(7));
    }

    #[test]
    fn exit_writes_back_mappings() {
        let (vm, dirs) = machine(2, 4);
        let (file, handle) = shared_file(vec![0; 16]);
        vm.start_process(1);
        assert_eq!(vm.map_file(1, handle, BASE, true), Ok(1));
        assert!(poke(&vm, &dirs, 1, BASE + 3, 3));

        vm.exit_process(1);
        assert_eq!(file.lock().contents()[3], 3);
        assert_eq!(vm.frames().pool().in_use(), 0);
    }

    #[test]
    fn refuses_bad_requests() {
        let (vm, _dirs) = machine(2, 4);
        let (_file, handle) = shared_file(vec![0; PAGE * 2]);
        let (_empty, empty) = shared_file(Vec::new());

        assert_eq!(vm.map_file(1, handle.clone(), BASE, true), Err(VmError::NoPageTable));
        vm.start_process(1);
        assert_eq!(vm.map_file(1, handle.clone(), 0, true), Err(VmError::BadAddress));
        assert_eq!(vm.map_file(1, handle.clone(), BASE + 1, true), Err(VmError::BadAddress));
        assert_eq!(vm.map_file(1, empty, BASE, true), Err(VmError::BadAddress));
        assert_eq!(
            vm.map_file(1, handle, kidneyos_shared::mem::OFFSET - PAGE, true),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn overlap_leaves_existing_pages() {
        let (vm, _dirs) = machine(2, 4);
        let (_file, handle) = shared_file(vec![0; PAGE * 3]);
        vm.start_process(1);
        assert!(vm.pages().install(1, BASE + 2 * PAGE, PageOrigin::Zero, true));

        assert_eq!(vm.map_file(1, handle, BASE, true), Err(VmError::AlreadyMapped));
        assert_eq!(vm.pages().lookup(1, BASE), None);
        assert_eq!(vm.pages().lookup(1, BASE + 2 * PAGE).map(|info| info.kind), Some(PageKind::Zero));
    }
}

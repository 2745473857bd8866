//! Supplemental page tables.
//!
//! For every user page a process may touch, records where its contents come
//! from when it isn't resident. Entries are created when a program is loaded,
//! a file is mapped, or the stack grows, and consulted on every page fault.

use super::{FrameTable, Pid, SwapSlot, SwapStore, VmError};
use crate::fs::FileRef;
use crate::mem::{FrameNumber, PageFrame};
use crate::sync::Mutex;
use alloc::{
    boxed::Box,
    collections::{btree_map::Entry, BTreeMap},
};
use core::fmt;
use kidneyos_shared::mem::{is_user_vaddr, pg_round_down, PAGE_FRAME_SIZE};
use log::{debug, trace};
use once_cell::race::OnceBox;

/// A page-sized window of a file: `read_bytes` from `offset`, followed by
/// `zero_bytes` of zeroes.
#[derive(Clone)]
pub struct FileRegion {
    file: FileRef,
    offset: u64,
    read_bytes: usize,
    zero_bytes: usize,
}

impl FileRegion {
    /// At most a page is read; a longer `read_bytes` is cut to one page.
    pub fn new(file: FileRef, offset: u64, read_bytes: usize) -> Self {
        let read_bytes = read_bytes.min(PAGE_FRAME_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_FRAME_SIZE - read_bytes,
        }
    }

    pub fn read_into(&self, page: &mut PageFrame) -> Result<(), VmError> {
        let mut file = self.file.lock();
        file.seek(self.offset);
        if file.read(&mut page.0[..self.read_bytes]) != self.read_bytes {
            return Err(VmError::ShortRead);
        }
        page.0[self.read_bytes..self.read_bytes + self.zero_bytes].fill(0);
        Ok(())
    }

    pub fn write_back(&self, page: &PageFrame) -> Result<(), VmError> {
        let mut file = self.file.lock();
        file.seek(self.offset);
        if file.write(&page.0[..self.read_bytes]) != self.read_bytes {
            return Err(VmError::ShortWrite);
        }
        Ok(())
    }
}

impl fmt::Debug for FileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRegion")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

/// Where a non-resident page gets its contents.
#[derive(Debug)]
pub enum PageOrigin {
    /// Part of an executable. Loaded from the file; once changed it goes to
    /// swap like any other private page.
    File(FileRegion),
    /// All zeroes.
    Zero,
    /// In swap. `previous` is what the page was before it was swapped out,
    /// and is restored when it comes back.
    SwappedOut {
        slot: SwapSlot,
        previous: Box<PageOrigin>,
    },
    /// Shared with a file mapped by the process. Changes are written back to
    /// the file rather than to swap.
    Mapped(FileRegion),
}

impl PageOrigin {
    pub fn kind(&self) -> PageKind {
        match self {
            Self::File(_) => PageKind::File,
            Self::Zero => PageKind::Zero,
            Self::SwappedOut { .. } => PageKind::SwappedOut,
            Self::Mapped(_) => PageKind::Mapped,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    File,
    Zero,
    SwappedOut,
    Mapped,
}

#[derive(Debug)]
pub struct PageEntry {
    pub upage: usize,
    pub origin: PageOrigin,
    pub writable: bool,
    /// Set while a fault is filling a frame for the page.
    loading: bool,
}

impl PageEntry {
    /// The swap slot the page occupies, if it's swapped out.
    pub fn into_swap_slot(self) -> Option<SwapSlot> {
        match self.origin {
            PageOrigin::SwappedOut { slot, .. } => Some(slot),
            _ => None,
        }
    }

    fn info(&self) -> PageInfo {
        PageInfo {
            upage: self.upage,
            kind: self.origin.kind(),
            writable: self.writable,
            swap_slot: match &self.origin {
                PageOrigin::SwappedOut { slot, .. } => Some(slot.index()),
                _ => None,
            },
        }
    }
}

/// A snapshot of a [`PageEntry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub upage: usize,
    pub kind: PageKind,
    pub writable: bool,
    pub swap_slot: Option<usize>,
}

/// How to fill a frame for a page that's being loaded.
enum Fill {
    Region(FileRegion),
    Zero,
    Swap(SwapSlot),
}

type Table = BTreeMap<usize, PageEntry>;

/// The supplemental page tables of all processes, keyed by page-aligned user
/// address. The lock is created the first time a process is set up.
pub struct PageTables {
    tables: OnceBox<Mutex<BTreeMap<Pid, Table>>>,
}

impl Default for PageTables {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTables {
    pub const fn new() -> Self {
        Self {
            tables: OnceBox::new(),
        }
    }

    /// Create an empty table for `pid`. A table that already exists is kept.
    pub fn init(&self, pid: Pid) {
        let tables = self
            .tables
            .get_or_init(|| Box::new(Mutex::new(BTreeMap::new())));
        tables.lock().entry(pid).or_default();
    }

    pub fn has_table(&self, pid: Pid) -> bool {
        self.with_table(pid, |_| ()).is_some()
    }

    /// Describe the page containing `addr`. Fails if the page is already
    /// described, isn't a user page, or `pid` has no table.
    pub fn install(&self, pid: Pid, addr: usize, origin: PageOrigin, writable: bool) -> bool {
        if !is_user_vaddr(addr) {
            return false;
        }
        let upage = pg_round_down(addr);
        self.with_table(pid, |table| match table.entry(upage) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                trace!("page: process {pid} {upage:#x} {:?}", origin.kind());
                slot.insert(PageEntry {
                    upage,
                    origin,
                    writable,
                    loading: false,
                });
                true
            }
        })
        .unwrap_or(false)
    }

    pub fn lookup(&self, pid: Pid, addr: usize) -> Option<PageInfo> {
        let upage = pg_round_down(addr);
        self.with_table(pid, |table| table.get(&upage).map(PageEntry::info))
            .flatten()
    }

    /// Whether none of the `pages` pages from `start` are described.
    pub fn is_range_free(&self, pid: Pid, start: usize, pages: usize) -> bool {
        let start = pg_round_down(start);
        let end = start + pages * PAGE_FRAME_SIZE;
        self.with_table(pid, |table| table.range(start..end).next().is_none())
            .unwrap_or(false)
    }

    /// The file region behind `upage` if it's part of a file mapping.
    pub fn mapped_region(&self, pid: Pid, upage: usize) -> Option<FileRegion> {
        self.with_table(pid, |table| match table.get(&upage) {
            Some(PageEntry {
                origin: PageOrigin::Mapped(region),
                ..
            }) => Some(region.clone()),
            _ => None,
        })
        .flatten()
    }

    /// Record that `upage` was written to `slot`. If the page is no longer
    /// described (its owner exited or unmapped it in the meantime) the slot is
    /// handed back.
    pub fn update_after_swap(&self, pid: Pid, upage: usize, slot: SwapSlot) -> Result<(), SwapSlot> {
        let Some(tables) = self.tables.get() else {
            return Err(slot);
        };
        let mut tables = tables.lock();
        let Some(entry) = tables.get_mut(&pid).and_then(|table| table.get_mut(&upage)) else {
            return Err(slot);
        };
        if matches!(entry.origin, PageOrigin::SwappedOut { .. }) {
            return Err(slot);
        }

        let previous = core::mem::replace(&mut entry.origin, PageOrigin::Zero);
        entry.origin = PageOrigin::SwappedOut {
            slot,
            previous: Box::new(previous),
        };
        Ok(())
    }

    /// Forget the page containing `addr`. A swap slot it holds is returned
    /// with the entry and is the caller's to free.
    pub fn remove(&self, pid: Pid, addr: usize) -> Option<PageEntry> {
        let upage = pg_round_down(addr);
        self.with_table(pid, |table| table.remove(&upage)).flatten()
    }

    /// Drop the table of `pid`, freeing the swap slots of its swapped-out
    /// pages. Returns how many pages were described.
    pub fn destroy(&self, pid: Pid, swap: &SwapStore) -> usize {
        let Some(table) = self.tables.get().and_then(|tables| tables.lock().remove(&pid)) else {
            return 0;
        };
        let count = table.len();
        for entry in table.into_values() {
            if let Some(slot) = entry.into_swap_slot() {
                swap.free(slot);
            }
        }
        count
    }

    /// Bring the page containing `addr` into a frame and map it.
    pub fn load(&self, pid: Pid, addr: usize, frames: &FrameTable) -> bool {
        match self.try_load(pid, addr, frames) {
            Ok(()) => true,
            Err(err) => {
                debug!("page: can't load {addr:#x} for process {pid}: {err}");
                false
            }
        }
    }

    /// Like [`Self::load`]. A page that is already mapped, or that another
    /// fault is loading right now, counts as loaded: the faulting access is
    /// retried and finds it mapped (or faults again).
    pub fn try_load(&self, pid: Pid, addr: usize, frames: &FrameTable) -> Result<(), VmError> {
        let upage = pg_round_down(addr);
        if !self.begin_load(pid, upage)? {
            trace!("page: {upage:#x} of process {pid} is already being loaded");
            return Ok(());
        }
        let result = self.load_claimed(pid, upage, frames);
        self.finish_load(pid, upage);
        result
    }

    fn load_claimed(&self, pid: Pid, upage: usize, frames: &FrameTable) -> Result<(), VmError> {
        if frames.mmu().translate(pid, upage).is_some() {
            return Ok(());
        }

        let kpage = frames.allocate(pid, upage)?;
        match self.fill(pid, upage, kpage, frames) {
            Ok(()) => {
                frames.unpin(kpage);
                trace!("page: loaded {upage:#x} for process {pid} into {kpage}");
                Ok(())
            }
            Err(err) => {
                frames.free(kpage);
                Err(err)
            }
        }
    }

    fn fill(&self, pid: Pid, upage: usize, kpage: FrameNumber, frames: &FrameTable) -> Result<(), VmError> {
        let (fill, writable) = self.take_fill(pid, upage)?;
        let swapped = matches!(fill, Fill::Swap(_));

        {
            let mut page = frames.pool().page(kpage);
            match fill {
                Fill::Region(region) => region.read_into(&mut page)?,
                Fill::Zero => page.0.fill(0),
                Fill::Swap(slot) => frames.swap().swap_in(slot, &mut page)?,
            }
        }

        if !frames.mmu().set_mapping(pid, upage, kpage, writable) {
            return Err(VmError::MapFailed);
        }
        if swapped {
            // Swap no longer holds a copy; make sure the next eviction saves one.
            frames.mmu().set_dirty(pid, upage, true);
        }
        Ok(())
    }

    /// Mark `upage` as being loaded. Returns `false` if it already was.
    fn begin_load(&self, pid: Pid, upage: usize) -> Result<bool, VmError> {
        self.with_table(pid, |table| {
            table
                .get_mut(&upage)
                .map(|entry| !core::mem::replace(&mut entry.loading, true))
        })
        .flatten()
        .ok_or(VmError::NoSuchPage)
    }

    fn finish_load(&self, pid: Pid, upage: usize) {
        self.with_table(pid, |table| {
            if let Some(entry) = table.get_mut(&upage) {
                entry.loading = false;
            }
        });
    }

    /// Work out how to fill `upage`. A swapped-out page gives up its slot and
    /// goes back to being what it was before.
    fn take_fill(&self, pid: Pid, upage: usize) -> Result<(Fill, bool), VmError> {
        let tables = self.tables.get().ok_or(VmError::NoPageTable)?;
        let mut tables = tables.lock();
        let table = tables.get_mut(&pid).ok_or(VmError::NoPageTable)?;
        let entry = table.get_mut(&upage).ok_or(VmError::NoSuchPage)?;

        let fill = match core::mem::replace(&mut entry.origin, PageOrigin::Zero) {
            PageOrigin::SwappedOut { slot, previous } => {
                entry.origin = *previous;
                Fill::Swap(slot)
            }
            origin => {
                let fill = match &origin {
                    PageOrigin::File(region) | PageOrigin::Mapped(region) => {
                        Fill::Region(region.clone())
                    }
                    _ => Fill::Zero,
                };
                entry.origin = origin;
                fill
            }
        };
        Ok((fill, entry.writable))
    }

    fn with_table<R>(&self, pid: Pid, f: impl FnOnce(&mut Table) -> R) -> Option<R> {
        let mut tables = self.tables.get()?.lock();
        tables.get_mut(&pid).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tempfs::TempFile;
    use crate::pagedir::{PageDirectories, PageMapper};
    use crate::vm::testing::{machine, machine_with, peek, poke};
    use alloc::{sync::Arc, vec, vec::Vec};

    const BASE: usize = 0x0804_8000;
    const PAGE: usize = PAGE_FRAME_SIZE;

    /// Page directories that refuse every new mapping.
    struct RefusingMapper(Arc<PageDirectories>);

    impl PageMapper for RefusingMapper {
        fn set_mapping(&self, _: Pid, _: usize, _: FrameNumber, _: bool) -> bool {
            false
        }
        fn clear_mapping(&self, pid: Pid, upage: usize) {
            self.0.clear_mapping(pid, upage);
        }
        fn translate(&self, pid: Pid, upage: usize) -> Option<FrameNumber> {
            self.0.translate(pid, upage)
        }
        fn is_accessed(&self, pid: Pid, upage: usize) -> bool {
            self.0.is_accessed(pid, upage)
        }
        fn set_accessed(&self, pid: Pid, upage: usize, accessed: bool) {
            self.0.set_accessed(pid, upage, accessed);
        }
        fn is_dirty(&self, pid: Pid, upage: usize) -> bool {
            self.0.is_dirty(pid, upage)
        }
        fn set_dirty(&self, pid: Pid, upage: usize, dirty: bool) {
            self.0.set_dirty(pid, upage, dirty);
        }
    }

    #[test]
    fn nothing_before_init() {
        let pages = PageTables::new();
        assert!(!pages.install(1, BASE, PageOrigin::Zero, true));
        assert_eq!(pages.lookup(1, BASE), None);
        assert!(pages.remove(1, BASE).is_none());
    }

    #[test]
    fn install_lookup_remove() {
        let pages = PageTables::new();
        pages.init(1);
        assert!(pages.install(1, BASE + 0x123, PageOrigin::Zero, false));
        assert!(!pages.install(1, BASE, PageOrigin::Zero, true));
        assert!(!pages.install(1, 0x8000_0000, PageOrigin::Zero, true));

        let info = pages.lookup(1, BASE + 0xfff).expect("described");
        assert_eq!(
            info,
            PageInfo {
                upage: BASE,
                kind: PageKind::Zero,
                writable: false,
                swap_slot: None,
            }
        );
        assert_eq!(pages.lookup(2, BASE), None);

        let entry = pages.remove(1, BASE).expect("described");
        assert_eq!(entry.upage, BASE);
        assert!(entry.into_swap_slot().is_none());
        assert_eq!(pages.lookup(1, BASE), None);
    }

    #[test]
    fn init_keeps_existing_table() {
        let pages = PageTables::new();
        pages.init(1);
        assert!(pages.install(1, BASE, PageOrigin::Zero, true));
        pages.init(1);
        assert!(pages.lookup(1, BASE).is_some());
    }

    #[test]
    fn range_checks() {
        let pages = PageTables::new();
        assert!(!pages.is_range_free(1, BASE, 1));
        pages.init(1);
        assert!(pages.install(1, BASE + 2 * PAGE, PageOrigin::Zero, true));
        assert!(pages.is_range_free(1, BASE, 2));
        assert!(!pages.is_range_free(1, BASE, 3));
    }

    #[test]
    fn partial_file_page_is_zero_filled() {
        let (vm, dirs) = machine(2, 4);
        let mut data = vec![0xee; 100];
        data.extend((0..200).map(|i| i as u8));
        let file = TempFile::new(data).into_ref();

        vm.start_process(1);
        let region = FileRegion::new(file, 100, 100);
        assert_eq!(region.zero_bytes, PAGE - 100);
        assert!(vm.pages().install(1, BASE, PageOrigin::File(region), false));
        assert!(vm.load(1, BASE));

        let kpage = dirs.translate(1, BASE).expect("mapped");
        let page = vm.frames().pool().page(kpage);
        let expected: Vec<u8> = (0..100).collect();
        assert_eq!(&page.0[..100], &expected[..]);
        assert!(page.0[100..].iter().all(|&b| b == 0));
        drop(page);

        let frame = vm.frames().lookup_by_physical(kpage).expect("registered");
        assert!(!frame.pinned);
    }

    #[test]
    fn short_file_fails_without_leaking() {
        let (vm, dirs) = machine(2, 4);
        let file = TempFile::new(vec![1; 50]).into_ref();
        vm.start_process(1);
        assert!(vm.pages().install(1, BASE, PageOrigin::File(FileRegion::new(file, 0, 100)), false));

        assert_eq!(vm.pages().try_load(1, BASE, vm.frames()), Err(VmError::ShortRead));
        assert!(vm.frames().is_empty());
        assert_eq!(vm.frames().pool().in_use(), 0);
        assert_eq!(dirs.translate(1, BASE), None);
    }

    #[test]
    fn refused_mapping_releases_frame() {
        let (vm, _dirs) = machine_with(2, 4, |dirs| Arc::new(RefusingMapper(dirs)) as Arc<dyn PageMapper>);
        vm.start_process(1);
        assert!(vm.pages().install(1, BASE, PageOrigin::Zero, true));

        assert_eq!(vm.pages().try_load(1, BASE, vm.frames()), Err(VmError::MapFailed));
        assert!(vm.frames().is_empty());
        assert_eq!(vm.frames().pool().in_use(), 0);
        assert_eq!(vm.pages().lookup(1, BASE).map(|info| info.kind), Some(PageKind::Zero));
    }

    #[test]
    fn load_unknown_page() {
        let (vm, _dirs) = machine(2, 4);
        assert_eq!(vm.pages().try_load(1, BASE, vm.frames()), Err(VmError::NoSuchPage));
        vm.start_process(1);
        assert!(!vm.load(1, BASE));
        assert_eq!(vm.frames().pool().in_use(), 0);
    }

    #[test]
    fn swap_restores_previous_origin() {
        let (vm, dirs) = machine(1, 4);
        let file = TempFile::new(vec![5; PAGE]).into_ref();
        vm.start_process(1);
        assert!(vm.pages().install(1, BASE, PageOrigin::File(FileRegion::new(file, 0, PAGE)), true));
        assert!(vm.pages().install(1, BASE + PAGE, PageOrigin::Zero, true));

        assert!(poke(&vm, &dirs, 1, BASE, 9));
        assert_eq!(peek(&vm, &dirs, 1, BASE + PAGE), Some(0));
        let info = vm.pages().lookup(1, BASE).expect("described");
        assert_eq!(info.kind, PageKind::SwappedOut);

        assert_eq!(peek(&vm, &dirs, 1, BASE), Some(9));
        assert_eq!(peek(&vm, &dirs, 1, BASE + 1), Some(5));
        assert_eq!(vm.pages().lookup(1, BASE).map(|info| info.kind), Some(PageKind::File));
    }

    #[test]
    fn region_never_exceeds_a_page() {
        let file = TempFile::new(vec![3; 2 * PAGE]).into_ref();
        let region = FileRegion::new(file, 0, 2 * PAGE);
        assert_eq!((region.read_bytes, region.zero_bytes), (PAGE, 0));

        let (vm, _dirs) = machine(1, 4);
        let mut page = vm.frames().pool().page(FrameNumber::new(0));
        assert_eq!(region.read_into(&mut page), Ok(()));
        assert!(page.0.iter().all(|&byte| byte == 3));
    }

    #[test]
    fn load_in_progress_is_left_alone() {
        let (vm, dirs) = machine(2, 4);
        vm.start_process(1);
        assert!(vm.pages().install(1, BASE, PageOrigin::Zero, true));
        assert!(poke(&vm, &dirs, 1, BASE, 9));
        let kpage = dirs.translate(1, BASE).expect("mapped");
        assert_eq!(vm.frames().evict(kpage), Ok(kpage));
        vm.frames().pool().free(kpage);

        // Another fault on the page is still filling a frame for it.
        assert_eq!(vm.pages().begin_load(1, BASE), Ok(true));
        assert!(vm.load(1, BASE));
        assert!(vm.frames().is_empty());
        assert_eq!(vm.pages().lookup(1, BASE).map(|info| info.kind), Some(PageKind::SwappedOut));
        assert_eq!(vm.swap().used_slots(), 1);

        vm.pages().finish_load(1, BASE);
        assert_eq!(peek(&vm, &dirs, 1, BASE), Some(9));
        assert_eq!(vm.swap().used_slots(), 0);
    }

    #[test]
    fn loading_a_mapped_page_changes_nothing() {
        let (vm, dirs) = machine(2, 4);
        vm.start_process(1);
        assert!(vm.pages().install(1, BASE, PageOrigin::Zero, true));
        assert!(poke(&vm, &dirs, 1, BASE, 4));

        assert!(vm.load(1, BASE));
        assert_eq!(vm.frames().len(), 1);
        assert_eq!(vm.frames().pool().in_use(), 1);
        assert_eq!(peek(&vm, &dirs, 1, BASE), Some(4));
    }

    #[test]
    fn update_after_swap_hands_back_slot() {
        let (vm, _dirs) = machine(1, 4);
        let slot = vm.swap().swap_out(&vm.frames().pool().page(FrameNumber::new(0))).expect("slot");
        let slot = vm.pages().update_after_swap(1, BASE, slot).expect_err("no table");

        vm.start_process(1);
        let slot = vm.pages().update_after_swap(1, BASE, slot).expect_err("no entry");
        assert_eq!(slot.index(), 0);

        assert!(vm.pages().install(1, BASE, PageOrigin::Zero, true));
        vm.pages().update_after_swap(1, BASE, slot).expect("recorded");
        assert_eq!(vm.pages().lookup(1, BASE).and_then(|info| info.swap_slot), Some(0));

        let entry = vm.pages().remove(1, BASE).expect("described");
        let slot = entry.into_swap_slot().expect("swapped out");
        vm.swap().free(slot);
        assert_eq!(vm.swap().used_slots(), 0);
    }

    #[test]
    fn destroy_frees_exact_slots() {
        let (vm, dirs) = machine(1, 4);
        vm.start_process(1);
        vm.start_process(2);
        assert!(vm.pages().install(2, BASE, PageOrigin::Zero, true));
        assert!(poke(&vm, &dirs, 2, BASE, 1));
        for i in 0..3 {
            assert!(vm.pages().install(1, BASE + i * PAGE, PageOrigin::Zero, true));
            assert!(poke(&vm, &dirs, 1, BASE + i * PAGE, 1));
        }
        // Slot 0: process 2, slots 1 and 2: process 1. One page is resident.
        assert_eq!(vm.pages().lookup(2, BASE).and_then(|info| info.swap_slot), Some(0));
        assert_eq!(vm.swap().used_slots(), 3);

        let frames: Vec<_> = vm.frames().detach_owned_by(1);
        for frame in frames {
            vm.frames().discard(frame);
        }
        assert_eq!(vm.pages().destroy(1, vm.swap()), 3);
        assert_eq!(vm.swap().used_slots(), 1);

        // The freed slots are handed out again, lowest first.
        let again = vm.swap().swap_out(&vm.frames().pool().page(FrameNumber::new(0))).expect("slot");
        assert_eq!(again.index(), 1);
        vm.swap().free(again);
        assert_eq!(vm.pages().destroy(1, vm.swap()), 0);
    }
}

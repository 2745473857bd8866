use super::elf::{Elf, ElfArchitecture, ElfEndianness, ElfHeader, ElfProgramHeader, ElfProgramType, ElfUsage};
use crate::fs::{read_file, FileRef};
use crate::vm::{FileRegion, PageOrigin, Pid, VirtualMemory, VmError};
use core::cmp::min;
use core::fmt;
use kidneyos_shared::mem::{is_user_vaddr, pg_offset, pg_round_down, pg_round_up, PAGE_FRAME_SIZE};
use log::debug;

#[derive(Debug, PartialEq, Eq)]
pub enum ElfError {
    /// Not a 32-bit ELF file, or cut short.
    Malformed,
    UnsupportedEndianess,
    UnsupportedVersion,
    UnsupportedType,
    UnsupportedMachine,
    /// Program header table is empty, too large, or has odd entries.
    BadProgramHeaders,
    /// Needs a dynamic loader.
    DynamicallyLinked,
    SegmentError(ElfSegmentError),
    Vm(VmError),
}

// Error types that will arise when we try to validate segment
#[derive(Debug, PartialEq, Eq)]
pub enum ElfSegmentError {
    DifferentPageOffset,
    OffsetOutOfRange,
    MemSizeLesserThanFileSize,
    EmptyMemSize,
    VMRegionOutOfRange,
    VMRegionWrapAround,
    PageZeroMapping,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::SegmentError(err) => write!(f, "bad segment: {err:?}"),
            ElfError::Vm(err) => write!(f, "can't set up address space: {err}"),
            other => write!(f, "unsupported executable: {other:?}"),
        }
    }
}

const ELF_PROGRAM_HEADER_SIZE: u16 = 32;
const MAX_PROGRAM_HEADERS: u16 = 1024;

// Function to verify ELF header
fn verify_elf_header(header: &ElfHeader) -> Result<(), ElfError> {
    if header.endianness != ElfEndianness::Little {
        return Err(ElfError::UnsupportedEndianess);
    }

    // Must be 1 for the original ELF version
    if header.header_version != 1 || header.elf_version != 1 {
        return Err(ElfError::UnsupportedVersion);
    }

    if header.usage != ElfUsage::Executable {
        return Err(ElfError::UnsupportedType);
    }

    if header.architecture != ElfArchitecture::X86 {
        return Err(ElfError::UnsupportedMachine);
    }

    if header.program_header_entry_size != ELF_PROGRAM_HEADER_SIZE
        || header.program_header_count == 0
        || header.program_header_count > MAX_PROGRAM_HEADERS
    {
        return Err(ElfError::BadProgramHeaders);
    }

    Ok(())
}

fn validate_segment(phdr: &ElfProgramHeader, file_len: usize) -> Result<(), ElfSegmentError> {
    let offset = phdr.file_offset as usize;
    let vaddr = phdr.virtual_address as usize;

    // p_offset and p_vaddr must have the same page offset.
    if pg_offset(offset) != pg_offset(vaddr) {
        return Err(ElfSegmentError::DifferentPageOffset);
    }

    // p_offset must point within FILE.
    if offset > file_len {
        return Err(ElfSegmentError::OffsetOutOfRange);
    }

    // p_memsz must be at least as big as p_filesz.
    if phdr.memory_size < phdr.file_size {
        return Err(ElfSegmentError::MemSizeLesserThanFileSize);
    }

    // The segment must not be empty.
    if phdr.memory_size == 0 {
        return Err(ElfSegmentError::EmptyMemSize);
    }

    // The virtual memory region must both start and end within the
    // user address space range.
    if !is_user_vaddr(vaddr) {
        return Err(ElfSegmentError::VMRegionOutOfRange);
    }

    // The region cannot "wrap around" across the kernel virtual
    // address space.
    let end = phdr
        .virtual_address
        .checked_add(phdr.memory_size)
        .ok_or(ElfSegmentError::VMRegionWrapAround)?;
    if !is_user_vaddr(end as usize - 1) {
        return Err(ElfSegmentError::VMRegionOutOfRange);
    }

    // Disallow mapping page 0.
    if vaddr < PAGE_FRAME_SIZE {
        return Err(ElfSegmentError::PageZeroMapping);
    }

    Ok(())
}

/// Describe every page of a loadable segment. The first `file_size` bytes
/// come from the file, the rest of `memory_size` is zeroes. Nothing is read
/// until the pages fault.
fn install_segment(vm: &VirtualMemory, pid: Pid, file: &FileRef, phdr: &ElfProgramHeader) -> Result<(), VmError> {
    let vaddr = phdr.virtual_address as usize;
    let page_offset = pg_offset(vaddr);
    let file_size = phdr.file_size as usize;
    let memory_size = phdr.memory_size as usize;

    let mut upage = pg_round_down(vaddr);
    let mut offset = u64::from(phdr.file_offset) - page_offset as u64;
    let (mut read_bytes, mut zero_bytes) = if file_size > 0 {
        let read_bytes = page_offset + file_size;
        (read_bytes, pg_round_up(page_offset + memory_size) - read_bytes)
    } else {
        (0, pg_round_up(page_offset + memory_size))
    };

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = min(read_bytes, PAGE_FRAME_SIZE);
        let origin = if page_read_bytes > 0 {
            PageOrigin::File(FileRegion::new(file.clone(), offset, page_read_bytes))
        } else {
            PageOrigin::Zero
        };
        if !vm.pages().install(pid, upage, origin, phdr.writable) {
            return Err(VmError::AlreadyMapped);
        }

        read_bytes -= page_read_bytes;
        zero_bytes -= PAGE_FRAME_SIZE - page_read_bytes;
        offset += PAGE_FRAME_SIZE as u64;
        upage += PAGE_FRAME_SIZE;
    }
    Ok(())
}

/// Set up the address space of `pid` to run the executable in `file`: its
/// loadable segments and the first page of its stack. Returns the entry
/// point.
///
/// On failure some pages may already be described; the caller tears the
/// process down with [`VirtualMemory::exit_process`].
pub fn load_elf(vm: &VirtualMemory, pid: Pid, file: &FileRef) -> Result<usize, ElfError> {
    let data = read_file(file);
    let elf = Elf::parse_bytes(&data).map_err(|_| ElfError::Malformed)?;

    verify_elf_header(&elf.header)?;

    for phdr in &elf.program_headers {
        match phdr.program_type {
            ElfProgramType::Load => {
                validate_segment(phdr, data.len()).map_err(ElfError::SegmentError)?;
                install_segment(vm, pid, file, phdr).map_err(ElfError::Vm)?;
            }
            ElfProgramType::Dynamic | ElfProgramType::Interpret | ElfProgramType::Shlib => {
                return Err(ElfError::DynamicallyLinked);
            }
            _ => {}
        }
    }

    if !vm.setup_stack(pid) {
        return Err(ElfError::Vm(VmError::OutOfMemory));
    }

    debug!(
        "elf: process {pid} loaded, entry {:#x}",
        elf.header.program_entry
    );
    Ok(elf.header.program_entry as usize)
}

//! User executables.

pub mod elf;
pub mod elf_loader;

pub use self::elf_loader::{load_elf, ElfError, ElfSegmentError};

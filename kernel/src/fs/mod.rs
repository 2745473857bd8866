//! The slice of the file system the memory manager depends on: an open file
//! that can be positioned, read and written.

pub mod tempfs;

use crate::sync::Mutex;
use alloc::{sync::Arc, vec, vec::Vec};

/// An open file.
///
/// Reads and writes are short only at end of file.
pub trait File {
    /// Set the position of the next read or write to `pos` bytes from the
    /// start of the file.
    fn seek(&mut self, pos: u64);
    /// Read up to `buf.len()` bytes at the current position, returning how
    /// many were read.
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// Write up to `buf.len()` bytes at the current position, returning how
    /// many were written. Never grows the file.
    fn write(&mut self, buf: &[u8]) -> usize;
    /// Length of the file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A file shared between the process that opened it and every page that is
/// backed by it.
pub type FileRef = Arc<Mutex<dyn File + Send>>;

/// Read the entire contents of `file` into kernel memory.
pub fn read_file(file: &FileRef) -> Vec<u8> {
    let mut file = file.lock();
    let Ok(len) = usize::try_from(file.len()) else {
        return Vec::new();
    };
    let mut data = vec![0; len];
    file.seek(0);
    let n = file.read(&mut data);
    data.truncate(n);
    data
}

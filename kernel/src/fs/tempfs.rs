use super::{File, FileRef};
use crate::sync::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::cmp::min;

/// A file that lives in kernel memory.
#[derive(Debug, Default)]
pub struct TempFile {
    data: Vec<u8>,
    pos: usize,
}

impl TempFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Wrap the file so it can back user pages.
    pub fn into_ref(self) -> FileRef {
        Arc::new(Mutex::new(self))
    }
}

impl File for TempFile {
    fn seek(&mut self, pos: u64) {
        self.pos = usize::try_from(pos).unwrap_or(usize::MAX);
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let start = min(self.pos, self.data.len());
        let n = min(buf.len(), self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos = start + n;
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let start = min(self.pos, self.data.len());
        let n = min(buf.len(), self.data.len() - start);
        self.data[start..start + n].copy_from_slice(&buf[..n]);
        self.pos = start + n;
        n
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

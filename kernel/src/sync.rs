//! Locking primitives used by the memory manager.
//!
//! Kernel threads are scheduled cooperatively on one core, so a spinning lock
//! is enough. The one lock held across block device transfers is the swap
//! store's.

pub mod mutex;

pub use self::mutex::{Mutex, MutexGuard};

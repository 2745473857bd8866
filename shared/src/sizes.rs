pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;

pub const SECTOR_SIZE: u32 = 512;

/// Size of the default swap partition: 4MB, or 1024 page slots.
pub const SWAP_SECTORS: u32 = 8192;
pub const SWAP_SIZE: u32 = SECTOR_SIZE * SWAP_SECTORS;

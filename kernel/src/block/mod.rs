pub mod block_core;
pub mod block_error;

pub use self::block_core::{Block, BlockManager, BlockOp, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
pub use self::block_error::BlockError;

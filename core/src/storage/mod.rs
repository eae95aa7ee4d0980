//! Block storage: pages, files, the write-ahead log and the buffer pool

pub mod buffer_pool;
pub mod disk;
pub mod engine;
pub mod page;
pub mod wal;

pub use buffer_pool::{Buffer, BufferManager, BufferPool, FrameId, PageFormatter};
pub use disk::DiskManager;
pub use engine::StorageEngine;
pub use page::{BlockId, DEFAULT_BLOCK_SIZE, Page};
pub use wal::{LogIterator, Lsn, WalManager};

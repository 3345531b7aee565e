//! FUSE filesystem implementation
//!
//! Path-based operations on a mount, the backing file helpers they use,
//! and the adapter that serves them to the kernel.

pub mod backing;
mod fuse;
mod handle;
mod ops;

pub use fuse::{NodeKey, NodeTable, StackFs};
pub use handle::HandleManager;
pub use ops::{file_type, millis, system_time, FileStat, BLOCK_SIZE};

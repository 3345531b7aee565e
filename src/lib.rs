//! stackfs - Layered copy-on-write filesystem
//!
//! This library provides a FUSE-based filesystem that stacks read-only
//! layers under one writable layer. Metadata for every layer lives in a
//! single sled database; file contents live in plain backing files.

pub mod config;
pub mod error;
pub mod fs;
pub mod layer;
pub mod metadata;
pub mod mount;

pub use config::Config;
pub use error::{Error, Result};
pub use mount::{Engine, Mount, MountOptions, ServeOptions};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::FileStat;
    pub use crate::metadata::FileEntry;
    pub use crate::mount::{Engine, Mount, MountOptions, ServeOptions};
}

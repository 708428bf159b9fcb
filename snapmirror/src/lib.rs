//! snapmirror library
//!
//! Mirrors btrfs snapshots file by file while keeping extents shared:
//! each missing snapshot is built from the nearest mirrored one, renamed and
//! near-duplicate files are reflinked from the base before rsync applies the
//! remaining differences in place.

pub mod config;
pub mod executor;
pub mod exit;
pub mod extent;
pub mod fs;
pub mod matcher;
pub mod mirror;
pub mod scheduler;
pub mod shutdown;
pub mod snapshot;
pub mod transfer;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use mirror::{Mirror, RunSummary};
pub use scheduler::RunMode;
pub use utils::errors::MirrorError;
pub type Result<T> = std::result::Result<T, MirrorError>;

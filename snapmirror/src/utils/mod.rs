//! Utility modules for the mirroring engine.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{EngineError, MirrorError, Result, TransferError, VolumeError};

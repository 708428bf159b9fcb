//! Process exit codes.

use crate::utils::MirrorError;

pub mod codes {
    /// Converged, or a dry run / single step completed.
    pub const SUCCESS: u8 = 0;
    /// Invalid command line arguments.
    pub const INVALID_ARGS: u8 = 1;
    /// Bad configuration, or no finalized snapshot on the mirror.
    pub const CONFIGURATION: u8 = 2;
    /// Writable snapshot creation failed.
    pub const SNAPSHOT: u8 = 3;
    /// Tree scan or clone engine failure.
    pub const ENGINE: u8 = 4;
    /// Delta transfer failed; the staged snapshot is left writable.
    pub const TRANSFER: u8 = 5;
    /// Data in place but the snapshot could not be made read-only.
    pub const FINALIZE: u8 = 6;
    /// Interrupted by signal (128 + SIGINT).
    pub const SIGINT: u8 = 130;
}

pub fn exit_code(error: &MirrorError) -> u8 {
    match error {
        MirrorError::Configuration(_) => codes::CONFIGURATION,
        MirrorError::Snapshot(_) => codes::SNAPSHOT,
        MirrorError::Scan { .. } | MirrorError::Engine(_) | MirrorError::Io(_) => codes::ENGINE,
        MirrorError::Transfer { .. } => codes::TRANSFER,
        MirrorError::Finalize { .. } => codes::FINALIZE,
        MirrorError::Cancelled => codes::SIGINT,
    }
}

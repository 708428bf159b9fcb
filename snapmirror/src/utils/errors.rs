//! Error types for the mirroring engine.
//!
//! Per-file problems (a clone the filesystem refuses) are not errors at this
//! level: they are counted by the extent engine and never abort a step.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    /// Fatal, no retry: the plan cannot be computed from the two snapshot sets.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] VolumeError),

    #[error("Scan error at {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Extent engine error: {0}")]
    Engine(#[from] EngineError),

    /// The staged snapshot is left in place, a later run retries it.
    #[error("Transfer failed for {label}: {source}")]
    Transfer {
        label: String,
        #[source]
        source: TransferError,
    },

    /// Data is in place but the snapshot could not be made read-only.
    #[error("Finalize failed for {label}, operator intervention required: {source}")]
    Finalize {
        label: String,
        #[source]
        source: VolumeError,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of an external volume primitive.
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Hard failure of the extent engine. Fails the step.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("staged tree missing: {0}")]
    StagedTreeMissing(PathBuf),

    #[error("base tree missing: {0}")]
    BaseTreeMissing(PathBuf),

    #[error("clone {src} -> {dst} failed: {source}")]
    Clone {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Failure reported by the delta-transfer mechanism.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed { program: String, status: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, MirrorError>;

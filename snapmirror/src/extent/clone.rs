//! Reflink primitives: whole-file and ranged extent cloning.

use nix::errno::Errno;
use std::fs::File;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloneError {
    /// The file pair cannot share extents here. Soft: the transfer writes the data instead.
    #[error("clone not supported: {0}")]
    Unsupported(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CloneError {
    pub fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::EOPNOTSUPP
            | Errno::EXDEV
            | Errno::EINVAL
            | Errno::ENOTTY
            | Errno::EPERM
            | Errno::EISDIR => Self::Unsupported(io::Error::from(errno)),
            other => Self::Io(io::Error::from(other)),
        }
    }

    #[cfg(test)]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

/// Extent sharing between two open files on the same filesystem.
pub trait CloneRange: Send + Sync {
    /// Make `dst` share all of `src`'s extents, replacing its content.
    fn clone_file(&self, src: &File, dst: &File) -> Result<(), CloneError>;

    /// Share `len` bytes of `src` at `src_offset` into `dst` at `dst_offset`.
    fn clone_range(
        &self,
        src: &File,
        src_offset: u64,
        dst: &File,
        dst_offset: u64,
        len: u64,
    ) -> Result<(), CloneError>;
}

/// FICLONE / FICLONERANGE ioctls (btrfs, xfs, bcachefs).
#[derive(Debug, Default, Clone, Copy)]
pub struct Ficlone;

#[cfg(target_os = "linux")]
mod ioctls {
    #[repr(C)]
    pub struct FileCloneRange {
        pub src_fd: i64,
        pub src_offset: u64,
        pub src_length: u64,
        pub dest_offset: u64,
    }

    nix::ioctl_write_int!(ficlone, 0x94, 9);
    nix::ioctl_write_ptr!(ficlonerange, 0x94, 13, FileCloneRange);
}

#[cfg(target_os = "linux")]
impl CloneRange for Ficlone {
    fn clone_file(&self, src: &File, dst: &File) -> Result<(), CloneError> {
        use std::os::fd::AsRawFd;

        // SAFETY: both descriptors stay open for the duration of the call
        unsafe { ioctls::ficlone(dst.as_raw_fd(), src.as_raw_fd() as _) }
            .map(drop)
            .map_err(CloneError::from_errno)
    }

    fn clone_range(
        &self,
        src: &File,
        src_offset: u64,
        dst: &File,
        dst_offset: u64,
        len: u64,
    ) -> Result<(), CloneError> {
        use std::os::fd::AsRawFd;

        let range = ioctls::FileCloneRange {
            src_fd: i64::from(src.as_raw_fd()),
            src_offset,
            src_length: len,
            dest_offset: dst_offset,
        };

        // SAFETY: `range` outlives the call and both descriptors are open
        unsafe { ioctls::ficlonerange(dst.as_raw_fd(), &range) }
            .map(drop)
            .map_err(CloneError::from_errno)
    }
}

#[cfg(not(target_os = "linux"))]
impl CloneRange for Ficlone {
    fn clone_file(&self, _src: &File, _dst: &File) -> Result<(), CloneError> {
        Err(CloneError::Unsupported(io::ErrorKind::Unsupported.into()))
    }

    fn clone_range(
        &self,
        _src: &File,
        _src_offset: u64,
        _dst: &File,
        _dst_offset: u64,
        _len: u64,
    ) -> Result<(), CloneError> {
        Err(CloneError::Unsupported(io::ErrorKind::Unsupported.into()))
    }
}

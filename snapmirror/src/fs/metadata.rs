//! Identity signals of a file inside one snapshot tree.

use serde::Serialize;
use std::fs;
use std::os::unix::fs::MetadataExt;

/// Cheap per-file signals read from `stat`, no file content involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileIdentity {
    /// File size in bytes
    pub size: u64,

    /// Last modified time, seconds since Unix epoch
    pub mtime: i64,

    /// Nanosecond part of the modified time
    pub mtime_nsec: i64,

    /// Device the inode lives on
    pub dev: u64,

    /// Inode number
    pub ino: u64,
}

impl FileIdentity {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        Self {
            size: metadata.len(),
            mtime: metadata.mtime(),
            mtime_nsec: metadata.mtime_nsec(),
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    /// `(dev, ino)`; equal keys within one tree are hardlinks of the same data.
    pub fn inode_key(&self) -> (u64, u64) {
        (self.dev, self.ino)
    }

    /// Same size and modification time, the rsync "quick check".
    pub fn quick_eq(&self, other: &FileIdentity) -> bool {
        self.size == other.size && self.mtime == other.mtime && self.mtime_nsec == other.mtime_nsec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_identity_from_file() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let identity = FileIdentity::from_metadata(&fs::metadata(temp_file.path())?);

        assert_eq!(identity.size, 12);
        assert!(identity.mtime > 0);
        assert!(identity.ino > 0);

        Ok(())
    }

    #[test]
    fn test_hardlinks_share_inode_key() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let original = dir.path().join("original");
        let link = dir.path().join("link");
        let other = dir.path().join("other");
        fs::write(&original, b"shared")?;
        fs::hard_link(&original, &link)?;
        fs::write(&other, b"shared")?;

        let a = FileIdentity::from_metadata(&fs::metadata(&original)?);
        let b = FileIdentity::from_metadata(&fs::metadata(&link)?);
        let c = FileIdentity::from_metadata(&fs::metadata(&other)?);

        assert_eq!(a.inode_key(), b.inode_key());
        assert_ne!(a.inode_key(), c.inode_key());

        Ok(())
    }
}

//! Volume primitives: listing, writable snapshot creation, read-only
//! finalization and flushing.
//!
//! The engine never implements volume semantics itself; it calls these
//! through [`VolumeOps`] so tests can substitute plain directories.

use crate::utils::VolumeError;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::debug;

pub trait VolumeOps: Send + Sync {
    /// Snapshot names directly under `root`
    fn list_snapshots(&self, root: &Path) -> Result<Vec<String>, VolumeError>;

    fn is_readonly(&self, snapshot: &Path) -> Result<bool, VolumeError>;

    /// Clone-on-write duplicate of `base` at `staged`, writable
    fn create_writable_snapshot(&self, base: &Path, staged: &Path) -> Result<(), VolumeError>;

    fn finalize_readonly(&self, snapshot: &Path) -> Result<(), VolumeError>;

    /// Flush pending writes of the filesystem holding `path`
    fn sync(&self, path: &Path) -> Result<(), VolumeError>;
}

/// Non-hidden directories under `root`, sorted by name.
pub fn list_snapshot_dirs(root: &Path) -> Result<Vec<String>, VolumeError> {
    let mut names = Vec::new();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }

    names.sort();
    Ok(names)
}

/// btrfs subvolumes driven through the `btrfs` command line tool.
#[derive(Debug, Clone)]
pub struct BtrfsVolume {
    program: String,
}

impl BtrfsVolume {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, VolumeError> {
        debug!("Running {} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| VolumeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(VolumeError::CommandFailed {
                command: format!("{} {}", self.program, args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for BtrfsVolume {
    fn default() -> Self {
        Self::new("btrfs")
    }
}

impl VolumeOps for BtrfsVolume {
    fn list_snapshots(&self, root: &Path) -> Result<Vec<String>, VolumeError> {
        list_snapshot_dirs(root)
    }

    fn is_readonly(&self, snapshot: &Path) -> Result<bool, VolumeError> {
        let path = snapshot.to_string_lossy();
        let out = self.run(&["property", "get", "-t", "subvol", &path, "ro"])?;
        Ok(out == "ro=true")
    }

    fn create_writable_snapshot(&self, base: &Path, staged: &Path) -> Result<(), VolumeError> {
        let base = base.to_string_lossy();
        let staged = staged.to_string_lossy();
        self.run(&["subvolume", "snapshot", &base, &staged])?;
        Ok(())
    }

    fn finalize_readonly(&self, snapshot: &Path) -> Result<(), VolumeError> {
        let path = snapshot.to_string_lossy();
        self.run(&["property", "set", "-t", "subvol", &path, "ro", "true"])?;
        Ok(())
    }

    // "btrfs subvolume sync" can spin forever in a TREE_SEARCH loop; a
    // filesystem sync does not.
    fn sync(&self, path: &Path) -> Result<(), VolumeError> {
        let path = path.to_string_lossy();
        self.run(&["filesystem", "sync", &path])?;
        Ok(())
    }
}

//! In-process stand-ins for the volume, clone and transfer collaborators.

use crate::extent::{CloneError, CloneRange};
use crate::snapshot::volume::{list_snapshot_dirs, VolumeOps};
use crate::transfer::{DeltaTransfer, TransferStats};
use crate::utils::{TransferError, VolumeError};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Snapshots are plain directories; read-only state is a hidden marker
/// file next to the snapshot.
#[derive(Default)]
pub struct DirVolume {
    pub calls: Mutex<Vec<String>>,
}

impl DirVolume {
    fn marker(snapshot: &Path) -> PathBuf {
        let name = snapshot
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        snapshot.with_file_name(format!(".{}.ro", name))
    }

    pub fn mark_readonly(snapshot: &Path) -> io::Result<()> {
        fs::write(Self::marker(snapshot), b"")
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn mutations(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl VolumeOps for DirVolume {
    fn list_snapshots(&self, root: &Path) -> Result<Vec<String>, VolumeError> {
        list_snapshot_dirs(root)
    }

    fn is_readonly(&self, snapshot: &Path) -> Result<bool, VolumeError> {
        Ok(Self::marker(snapshot).exists())
    }

    fn create_writable_snapshot(&self, base: &Path, staged: &Path) -> Result<(), VolumeError> {
        self.record(format!("snapshot {}", staged.display()));
        copy_tree(base, staged)?;
        Ok(())
    }

    fn finalize_readonly(&self, snapshot: &Path) -> Result<(), VolumeError> {
        self.record(format!("finalize {}", snapshot.display()));
        Self::mark_readonly(snapshot)?;
        Ok(())
    }

    fn sync(&self, _path: &Path) -> Result<(), VolumeError> {
        Ok(())
    }
}

pub fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(from).map_err(io::Error::other)?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Makes `staged` equal to `desired`, rewriting changed files in place.
#[derive(Default)]
pub struct CopyTransfer;

impl DeltaTransfer for CopyTransfer {
    fn sync(
        &self,
        desired: &Path,
        staged: &Path,
        cancel: &CancellationToken,
    ) -> Result<TransferStats, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let mut wanted = BTreeSet::new();
        let mut literal = 0u64;

        for entry in WalkDir::new(desired).min_depth(1) {
            let entry = entry.map_err(io::Error::other)?;
            let rel = entry
                .path()
                .strip_prefix(desired)
                .map_err(io::Error::other)?
                .to_path_buf();
            let dest = staged.join(&rel);
            wanted.insert(rel);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)?;
                continue;
            }

            let data = fs::read(entry.path())?;
            let current = fs::read(&dest).unwrap_or_default();
            if current == data {
                continue;
            }

            let file = OpenOptions::new().write(true).create(true).truncate(false).open(&dest)?;
            file.set_len(data.len() as u64)?;
            for (i, chunk) in data.chunks(16).enumerate() {
                let offset = i * 16;
                if current.get(offset..offset + chunk.len()) != Some(chunk) {
                    file.write_all_at(chunk, offset as u64)?;
                    literal += chunk.len() as u64;
                }
            }
        }

        let stale: Vec<PathBuf> = WalkDir::new(staged)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let rel = e.path().strip_prefix(staged).ok()?.to_path_buf();
                (!wanted.contains(&rel)).then(|| e.path().to_path_buf())
            })
            .collect();
        for path in stale {
            if path.is_dir() {
                fs::remove_dir(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }

        Ok(TransferStats {
            literal_bytes: Some(literal),
            ..Default::default()
        })
    }
}

/// Copies bytes instead of sharing extents and records every range call.
#[derive(Default)]
pub struct CopyCloner {
    pub ranges: Mutex<Vec<(u64, u64, u64)>>,
    pub refuse: bool,
    pub fail: bool,
}

impl CopyCloner {
    fn check(&self) -> Result<(), CloneError> {
        if self.refuse {
            return Err(CloneError::Unsupported(io::ErrorKind::Unsupported.into()));
        }
        if self.fail {
            return Err(CloneError::Io(io::Error::other("device error")));
        }
        Ok(())
    }
}

impl CloneRange for CopyCloner {
    fn clone_file(&self, src: &File, dst: &File) -> Result<(), CloneError> {
        self.check()?;
        let mut data = Vec::new();
        (&*src).read_to_end(&mut data)?;
        dst.set_len(0)?;
        dst.write_all_at(&data, 0)?;
        Ok(())
    }

    fn clone_range(
        &self,
        src: &File,
        src_offset: u64,
        dst: &File,
        dst_offset: u64,
        len: u64,
    ) -> Result<(), CloneError> {
        self.check()?;
        self.ranges
            .lock()
            .unwrap()
            .push((src_offset, dst_offset, len));
        let mut buf = vec![0u8; len as usize];
        src.read_exact_at(&mut buf, src_offset)?;
        dst.write_all_at(&buf, dst_offset)?;
        Ok(())
    }
}

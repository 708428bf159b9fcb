//! Extent engine: seeds the staged snapshot with clones of matched base files.
//!
//! Clones are read from the finalized base on the target volume and written
//! to a temporary sibling of the staged file, which is then renamed over it.
//! A refused clone leaves the staged file exactly as it was.

pub mod clone;

pub use clone::{CloneError, CloneRange, Ficlone};

use crate::config::EngineConfig;
use crate::matcher::{Extent, Match, MatchKind};
use crate::utils::EngineError;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-step outcome of clone application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppliedCount {
    /// Staged files seeded from a base file
    pub applied: usize,
    pub cloned_bytes: u64,
    /// Matches whose confidence is under the clone threshold
    pub below_threshold: usize,
    /// Clones the filesystem refused
    pub unsupported: usize,
    /// Base file gone or changed since it was listed
    pub missing_base: usize,
    /// Partial matches with no range left after alignment
    pub unaligned: usize,
}

impl AddAssign for AppliedCount {
    fn add_assign(&mut self, other: Self) {
        self.applied += other.applied;
        self.cloned_bytes += other.cloned_bytes;
        self.below_threshold += other.below_threshold;
        self.unsupported += other.unsupported;
        self.missing_base += other.missing_base;
        self.unaligned += other.unaligned;
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub clone_threshold: f64,
    pub alignment: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            clone_threshold: config.clone_threshold,
            alignment: config.alignment,
        }
    }
}

pub trait CloneEngine: Send + Sync {
    /// Seed the staged copy of `m.target_path` from `base_root/m.base_path`.
    fn apply_one(
        &self,
        m: &Match,
        base_root: &Path,
        staged_root: &Path,
    ) -> Result<AppliedCount, EngineError>;

    fn apply(
        &self,
        matches: &[Match],
        base_root: &Path,
        staged_root: &Path,
    ) -> Result<AppliedCount, EngineError> {
        let mut total = AppliedCount::default();
        for m in matches {
            total += self.apply_one(m, base_root, staged_root)?;
        }
        Ok(total)
    }
}

pub struct ReflinkEngine<C = Ficlone> {
    cloner: C,
    options: EngineOptions,
}

impl ReflinkEngine<Ficlone> {
    pub fn new(options: EngineOptions) -> Self {
        Self::with_cloner(Ficlone, options)
    }
}

impl<C: CloneRange> ReflinkEngine<C> {
    pub fn with_cloner(cloner: C, options: EngineOptions) -> Self {
        Self { cloner, options }
    }

    fn clone_into(
        &self,
        m: &Match,
        src: &File,
        tmp: &File,
        extents: &[Extent],
    ) -> Result<(), CloneError> {
        match m.kind {
            MatchKind::Identity => self.cloner.clone_file(src, tmp),
            MatchKind::Partial => {
                tmp.set_len(m.target_len)?;
                for e in extents {
                    self.cloner
                        .clone_range(src, e.src_offset, tmp, e.dst_offset, e.len)?;
                }
                Ok(())
            }
        }
    }
}

impl<C: CloneRange> CloneEngine for ReflinkEngine<C> {
    fn apply_one(
        &self,
        m: &Match,
        base_root: &Path,
        staged_root: &Path,
    ) -> Result<AppliedCount, EngineError> {
        if m.confidence < self.options.clone_threshold {
            return Ok(AppliedCount {
                below_threshold: 1,
                ..Default::default()
            });
        }

        let src_path = base_root.join(&m.base_path);
        let dst_path = staged_root.join(&m.target_path);

        let src = match File::open(&src_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Base file vanished: {}", src_path.display());
                return Ok(missing_base());
            }
            Err(e) => return Err(io_error(&src_path, e)),
        };
        let src_len = src.metadata().map_err(|e| io_error(&src_path, e))?.len();
        if src_len != m.base_len {
            debug!(
                "Base file {} is {} bytes, listed as {}",
                src_path.display(),
                src_len,
                m.base_len
            );
            return Ok(missing_base());
        }

        let extents = match m.kind {
            MatchKind::Identity => m.extents.clone(),
            MatchKind::Partial => align_extents(
                &m.extents,
                self.options.alignment,
                m.base_len,
                m.target_len,
            ),
        };
        if extents.is_empty() {
            return Ok(AppliedCount {
                unaligned: 1,
                ..Default::default()
            });
        }

        match fs::symlink_metadata(&dst_path) {
            Ok(meta) if !meta.is_file() => {
                debug!("Staged path is not a regular file: {}", dst_path.display());
                return Ok(AppliedCount {
                    unsupported: 1,
                    ..Default::default()
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = dst_path.parent() {
                    fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
                }
            }
            Err(e) => return Err(io_error(&dst_path, e)),
        }

        let tmp_path = temp_sibling(&dst_path);
        let tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| io_error(&tmp_path, e))?;

        if let Err(e) = self.clone_into(m, &src, &tmp, &extents) {
            drop(tmp);
            if let Err(rm) = fs::remove_file(&tmp_path) {
                warn!("Failed to remove {}: {}", tmp_path.display(), rm);
            }
            return match e {
                CloneError::Unsupported(reason) => {
                    debug!(
                        "Clone {} -> {} refused: {}",
                        src_path.display(),
                        dst_path.display(),
                        reason
                    );
                    Ok(AppliedCount {
                        unsupported: 1,
                        ..Default::default()
                    })
                }
                CloneError::Io(source) => Err(EngineError::Clone {
                    src: src_path,
                    dst: dst_path,
                    source,
                }),
            };
        }

        drop(tmp);
        fs::rename(&tmp_path, &dst_path).map_err(|e| io_error(&dst_path, e))?;

        Ok(AppliedCount {
            applied: 1,
            cloned_bytes: extents.iter().map(|e| e.len).sum(),
            ..Default::default()
        })
    }
}

/// Apply `matches` with up to `jobs` clones in flight.
///
/// Stops dispatching once `cancel` fires or a clone fails hard; clones
/// already running complete. The first hard error is returned after all
/// dispatched work has finished.
pub async fn apply_concurrently(
    engine: Arc<dyn CloneEngine>,
    matches: Vec<Match>,
    base_root: PathBuf,
    staged_root: PathBuf,
    jobs: usize,
    cancel: &CancellationToken,
) -> Result<AppliedCount, EngineError> {
    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let base_root = Arc::new(base_root);
    let staged_root = Arc::new(staged_root);
    let stop = cancel.child_token();
    let mut handles = Vec::with_capacity(matches.len());

    for m in matches {
        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => {
                permit.map_err(|e| EngineError::Worker(e.to_string()))?
            }
        };

        let engine = Arc::clone(&engine);
        let base_root = Arc::clone(&base_root);
        let staged_root = Arc::clone(&staged_root);
        let stop = stop.clone();

        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let result = engine.apply_one(&m, &base_root, &staged_root);
            if result.is_err() {
                stop.cancel();
            }
            result
        }));
    }

    let mut total = AppliedCount::default();
    let mut first_error = None;

    for handle in handles {
        match handle.await {
            Ok(Ok(count)) => total += count,
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(EngineError::Worker(e.to_string()));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(total),
    }
}

/// Trim extents to offsets the clone primitive accepts.
///
/// Both offsets must sit on an `alignment` boundary. The length is rounded
/// down as well unless the range ends at the end of both files.
pub fn align_extents(
    extents: &[Extent],
    alignment: u64,
    base_len: u64,
    target_len: u64,
) -> Vec<Extent> {
    if alignment <= 1 {
        return extents.iter().copied().filter(|e| e.len > 0).collect();
    }

    extents
        .iter()
        .filter_map(|e| {
            if e.src_offset % alignment != e.dst_offset % alignment {
                return None;
            }
            let skip = (alignment - e.src_offset % alignment) % alignment;
            if skip >= e.len {
                return None;
            }

            let src_offset = e.src_offset + skip;
            let dst_offset = e.dst_offset + skip;
            let mut len = e.len - skip;

            let at_eof = src_offset + len == base_len && dst_offset + len == target_len;
            if !at_eof {
                len -= len % alignment;
            }

            (len > 0).then_some(Extent {
                src_offset,
                dst_offset,
                len,
            })
        })
        .collect()
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.snapmirror-tmp", name))
}

fn missing_base() -> AppliedCount {
    AppliedCount {
        missing_base: 1,
        ..Default::default()
    }
}

fn io_error(path: &Path, source: io::Error) -> EngineError {
    EngineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

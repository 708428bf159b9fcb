//! Snapshot tree listing.
//!
//! Walks one snapshot root and records every regular file with its identity
//! signals. Directories, symlinks and special files are not listed: they
//! carry no extents worth sharing and the transfer recreates them.

use crate::fs::{FileIdentity, Fingerprint};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Stay on the filesystem of the root
    pub same_file_system: bool,

    /// Maximum number of directory handles kept open at once
    pub max_open: usize,

    /// Exclude patterns (substring of the file name)
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            same_file_system: true,
            max_open: 128,
            exclude_patterns: Vec::new(),
        }
    }
}

/// A regular file discovered in a snapshot tree
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the snapshot root
    pub path: PathBuf,

    pub identity: FileIdentity,

    /// Filled in lazily, only for files that take part in matching
    pub fingerprint: Option<Fingerprint>,
}

impl FileEntry {
    /// Returns None for anything that is not a regular file.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        if !entry.file_type().is_file() {
            return Ok(None);
        }

        let metadata = entry.metadata()?;
        let path = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            .to_path_buf();

        Ok(Some(Self {
            path,
            identity: FileIdentity::from_metadata(&metadata),
            fingerprint: None,
        }))
    }

    pub fn size(&self) -> u64 {
        self.identity.size
    }

    /// Final path component, used for tie-breaking between candidates
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Listing of one snapshot tree, ordered by relative path
#[derive(Debug, Clone)]
pub struct TreeListing {
    pub root: PathBuf,
    pub entries: Vec<FileEntry>,
    index: HashMap<PathBuf, usize>,
}

impl TreeListing {
    /// Build a listing from already collected entries (sorted here)
    pub fn from_entries(root: impl Into<PathBuf>, mut entries: Vec<FileEntry>) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.path.clone(), i))
            .collect();

        Self {
            root: root.into(),
            entries,
            index,
        }
    }

    pub fn get(&self, path: &Path) -> Option<&FileEntry> {
        self.index.get(path).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size()).sum()
    }

    /// Absolute path of an entry
    pub fn absolute(&self, entry: &FileEntry) -> PathBuf {
        self.root.join(&entry.path)
    }
}

/// Walk a snapshot tree and collect all regular files
///
/// # Arguments
/// * `root` - Snapshot root
/// * `options` - Walking options
///
/// # Returns
/// * `Ok(TreeListing)` - Files sorted by relative path
/// * `Err(io::Error)` - If the tree cannot be read
///
/// # Example
/// ```no_run
/// use snapmirror::fs::walker::{scan_tree, WalkOptions};
/// use std::path::Path;
///
/// let listing = scan_tree(Path::new("/mnt/source/2020-01-01"), &WalkOptions::default()).unwrap();
/// println!("Found {} files", listing.len());
/// ```
pub fn scan_tree(root: &Path, options: &WalkOptions) -> std::io::Result<TreeListing> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .same_file_system(options.same_file_system)
        .max_open(options.max_open);

    // Excluded directories are pruned, not descended into
    let entries_iter = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !should_exclude(e, &options.exclude_patterns));

    for entry in entries_iter {
        let entry = entry?;

        if let Some(file) = FileEntry::from_entry(&entry, root)? {
            entries.push(file);
        }
    }

    Ok(TreeListing::from_entries(root, entries))
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}

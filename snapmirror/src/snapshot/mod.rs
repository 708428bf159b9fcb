//! Snapshot labels, per-volume snapshot sets and the merged view the
//! scheduler plans over.

pub mod volume;

pub use volume::{BtrfsVolume, VolumeOps};

use crate::utils::VolumeError;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Sortable snapshot identifier; the directory name under a volume root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SnapshotLabel(String);

impl SnapshotLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the label as an ISO date (`YYYY-MM-DD`)
    pub fn to_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.0, "%Y-%m-%d").ok()
    }
}

impl fmt::Display for SnapshotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapshotLabel {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

/// Snapshots of one volume root, ordered by label. Labels are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSet {
    snapshots: BTreeMap<SnapshotLabel, bool>,
}

impl SnapshotSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set where every snapshot is finalized
    pub fn finalized<I, L>(labels: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<SnapshotLabel>,
    {
        let mut set = Self::new();
        for label in labels {
            set.insert(label.into(), true);
        }
        set
    }

    /// Returns false if the label was already present.
    pub fn insert(&mut self, label: SnapshotLabel, finalized: bool) -> bool {
        if self.snapshots.contains_key(&label) {
            return false;
        }
        self.snapshots.insert(label, finalized);
        true
    }

    pub fn mark_finalized(&mut self, label: &SnapshotLabel) {
        self.snapshots.insert(label.clone(), true);
    }

    pub fn contains(&self, label: &SnapshotLabel) -> bool {
        self.snapshots.contains_key(label)
    }

    pub fn is_finalized(&self, label: &SnapshotLabel) -> bool {
        self.snapshots.get(label).copied().unwrap_or(false)
    }

    pub fn labels(&self) -> impl Iterator<Item = &SnapshotLabel> {
        self.snapshots.keys()
    }
}

/// One label across both volumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub label: SnapshotLabel,
    pub exists_in_source: bool,
    pub exists_in_target: bool,
    pub is_finalized: bool,
}

impl Snapshot {
    /// Only finalized target snapshots may serve as a base.
    pub fn is_base_eligible(&self) -> bool {
        self.exists_in_target && self.is_finalized
    }

    /// Present in the source but not (or not completely) mirrored yet.
    pub fn is_missing(&self) -> bool {
        self.exists_in_source && !self.is_base_eligible()
    }
}

/// Merge the two sets into one label-ordered sequence.
pub fn merge(source: &SnapshotSet, target: &SnapshotSet) -> Vec<Snapshot> {
    let mut labels: Vec<&SnapshotLabel> = source.labels().chain(target.labels()).collect();
    labels.sort();
    labels.dedup();

    labels
        .into_iter()
        .map(|label| Snapshot {
            label: label.clone(),
            exists_in_source: source.contains(label),
            exists_in_target: target.contains(label),
            is_finalized: target.is_finalized(label),
        })
        .collect()
}

/// Read the snapshot set of a volume root. Read-only state is only probed
/// when `probe_readonly` is set; otherwise every snapshot counts as finalized.
pub fn read_set(
    volume: &dyn VolumeOps,
    root: &Path,
    probe_readonly: bool,
) -> Result<SnapshotSet, VolumeError> {
    let mut set = SnapshotSet::new();
    for name in volume.list_snapshots(root)? {
        let finalized = if probe_readonly {
            volume.is_readonly(&root.join(&name))?
        } else {
            true
        };
        set.insert(SnapshotLabel::new(name), finalized);
    }
    Ok(set)
}

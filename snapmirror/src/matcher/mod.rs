//! File-similarity matching between a base snapshot and the desired state.
//!
//! Unchanged paths already share extents once the writable snapshot exists,
//! so the matcher only looks for content that moved: renamed files, copies,
//! and files edited in the middle that keep a long common prefix/suffix.

pub mod similarity;

pub use similarity::{MatcherOptions, SimilarityMatcher};

use crate::fs::fingerprint::fingerprint_entries;
use crate::fs::TreeListing;
use serde::Serialize;
use std::io;
use std::ops::Range;
use std::path::PathBuf;

/// A byte range of the base file that equals a byte range of the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Extent {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub len: u64,
}

impl Extent {
    pub fn dst_range(&self) -> Range<u64> {
        self.dst_offset..self.dst_offset + self.len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Same content at a different path
    Identity,
    /// Shared prefix and/or suffix only
    Partial,
}

/// Seed `target_path` of the new snapshot from `base_path` of the base.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub base_path: PathBuf,
    pub target_path: PathBuf,
    pub kind: MatchKind,
    /// 1.0 for identity matches, matched share of the larger file otherwise
    pub confidence: f64,
    pub base_len: u64,
    pub target_len: u64,
    /// Non-overlapping, ordered by destination offset
    pub extents: Vec<Extent>,
}

impl Match {
    pub fn whole_file(base_path: PathBuf, target_path: PathBuf, len: u64) -> Self {
        Self {
            base_path,
            target_path,
            kind: MatchKind::Identity,
            confidence: 1.0,
            base_len: len,
            target_len: len,
            extents: vec![Extent {
                src_offset: 0,
                dst_offset: 0,
                len,
            }],
        }
    }

    pub fn matched_bytes(&self) -> u64 {
        self.extents.iter().map(|e| e.len).sum()
    }

    /// Destination ranges no extent covers; what the transfer must still write.
    pub fn uncovered(&self) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        let mut pos = 0u64;
        for extent in &self.extents {
            if extent.dst_offset > pos {
                gaps.push(pos..extent.dst_offset);
            }
            pos = pos.max(extent.dst_offset + extent.len);
        }
        if pos < self.target_len {
            gaps.push(pos..self.target_len);
        }
        gaps
    }
}

/// Summary of a match set, reported by dry runs and step logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchStats {
    pub desired_files: usize,
    pub desired_bytes: u64,
    pub identity_matches: usize,
    pub identity_bytes: u64,
    pub partial_matches: usize,
    pub partial_bytes: u64,
}

impl MatchStats {
    pub fn from_matches(desired: &TreeListing, matches: &[Match]) -> Self {
        let mut stats = Self {
            desired_files: desired.len(),
            desired_bytes: desired.total_bytes(),
            ..Self::default()
        };
        for m in matches {
            match m.kind {
                MatchKind::Identity => {
                    stats.identity_matches += 1;
                    stats.identity_bytes += m.matched_bytes();
                }
                MatchKind::Partial => {
                    stats.partial_matches += 1;
                    stats.partial_bytes += m.matched_bytes();
                }
            }
        }
        stats
    }

    /// Bytes that clones would cover at the given confidence threshold
    pub fn clonable_bytes(matches: &[Match], threshold: f64) -> u64 {
        matches
            .iter()
            .filter(|m| m.confidence >= threshold)
            .map(Match::matched_bytes)
            .sum()
    }
}

/// Strategy that pairs desired files with base files.
pub trait Matcher: Send + Sync {
    /// Indices of base and desired entries whose fingerprints `match_trees` consults.
    fn fingerprints_needed(
        &self,
        base: &TreeListing,
        desired: &TreeListing,
    ) -> (Vec<usize>, Vec<usize>) {
        ((0..base.len()).collect(), (0..desired.len()).collect())
    }

    /// Matches ordered by target path. At most one match per target path.
    fn match_trees(&self, base: &TreeListing, desired: &TreeListing) -> io::Result<Vec<Match>>;
}

/// Fingerprint what `matcher` needs, `jobs` files at a time.
/// Returns the number of files read.
pub async fn prepare_listings(
    matcher: &dyn Matcher,
    base: &mut TreeListing,
    desired: &mut TreeListing,
    max_window: u64,
    jobs: usize,
) -> io::Result<usize> {
    let (base_idx, desired_idx) = matcher.fingerprints_needed(base, desired);
    let read_base = fingerprint_entries(base, &base_idx, max_window, jobs).await?;
    let read_desired = fingerprint_entries(desired, &desired_idx, max_window, jobs).await?;
    Ok(read_base + read_desired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_file_match_covers_everything() {
        let m = Match::whole_file("a.txt".into(), "b.txt".into(), 42);
        assert_eq!(m.matched_bytes(), 42);
        assert!(m.uncovered().is_empty());
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn test_uncovered_middle_gap() {
        let m = Match {
            base_path: "f".into(),
            target_path: "f2".into(),
            kind: MatchKind::Partial,
            confidence: 0.98,
            base_len: 1000,
            target_len: 1000,
            extents: vec![
                Extent { src_offset: 0, dst_offset: 0, len: 500 },
                Extent { src_offset: 520, dst_offset: 520, len: 480 },
            ],
        };
        assert_eq!(m.uncovered(), vec![500..520]);
        assert_eq!(m.matched_bytes(), 980);
        assert_eq!(m.extents[1].dst_range(), 520..1000);
    }

    #[test]
    fn test_clonable_bytes_respects_threshold() {
        let whole = Match::whole_file("a".into(), "b".into(), 100);
        let mut partial = Match::whole_file("c".into(), "d".into(), 50);
        partial.kind = MatchKind::Partial;
        partial.confidence = 0.6;

        let matches = vec![whole, partial];
        assert_eq!(MatchStats::clonable_bytes(&matches, 1.0), 100);
        assert_eq!(MatchStats::clonable_bytes(&matches, 0.5), 150);
    }
}

//! Size + fingerprint based matcher.
//!
//! Rules, applied per desired file in path order:
//! 1. a base file at the same path with the same size and mtime (or the same
//!    fingerprint) is unchanged and needs nothing;
//! 2. a base file elsewhere with the same size and fingerprint is an identity
//!    match, ties broken by file name distance, then equal mtime, then path;
//! 3. a base file of close size whose head or tail window matches is a
//!    partial candidate, scored by the bytes of common prefix and suffix.
//!    Windows are compared at the smaller of the two files' windows, and pairs
//!    too far apart in size to reach the minimum coverage are skipped;
//! 4. otherwise the file is left to the transfer.

use super::{Extent, Match, MatchKind, Matcher};
use crate::config::MatcherConfig;
use crate::fs::fingerprint::{common_prefix_len, common_suffix_len};
use crate::fs::{FileEntry, Fingerprint, TreeListing};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use tracing::debug;

/// Byte-exact comparisons attempted per desired file
const MAX_PARTIAL_CANDIDATES: usize = 8;

#[derive(Debug, Clone)]
pub struct MatcherOptions {
    pub size_tolerance: f64,
    pub min_tolerance_bytes: u64,
    pub min_partial_coverage: f64,
}

impl Default for MatcherOptions {
    fn default() -> Self {
        Self::from(&MatcherConfig::default())
    }
}

impl From<&MatcherConfig> for MatcherOptions {
    fn from(config: &MatcherConfig) -> Self {
        Self {
            size_tolerance: config.size_tolerance,
            min_tolerance_bytes: config.min_tolerance_bytes,
            min_partial_coverage: config.min_partial_coverage,
        }
    }
}

impl MatcherOptions {
    fn sizes_close(&self, a: u64, b: u64) -> bool {
        let relative = (a.max(b) as f64 * self.size_tolerance) as u64;
        a.abs_diff(b) <= relative.max(self.min_tolerance_bytes)
    }

    /// Whether a shared prefix and suffix could cover enough of the larger file.
    fn coverage_reachable(&self, a: u64, b: u64) -> bool {
        a.min(b) as f64 >= self.min_partial_coverage * a.max(b) as f64
    }

    /// Inclusive size range that can contain every close size of `size`.
    fn size_window(&self, size: u64) -> (u64, u64) {
        let t = self.size_tolerance.clamp(0.0, 0.999);
        let low = (size as f64 * (1.0 - t)) as u64;
        let high = ((size + self.min_tolerance_bytes) as f64 / (1.0 - t)).ceil() as u64;
        (
            low.saturating_sub(self.min_tolerance_bytes),
            high.saturating_add(1),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityMatcher {
    options: MatcherOptions,
}

struct Proposal {
    confidence: f64,
    group: (u64, u64),
    desired: usize,
    base: usize,
    prefix: u64,
    suffix: u64,
}

impl SimilarityMatcher {
    pub fn new(options: MatcherOptions) -> Self {
        Self { options }
    }

    /// Non-empty base files as `(size, index)`, sorted.
    fn sizes(base: &TreeListing, keep: impl Fn(usize, &FileEntry) -> bool) -> Vec<(u64, usize)> {
        let mut sizes: Vec<(u64, usize)> = base
            .entries
            .iter()
            .enumerate()
            .filter(|(i, e)| e.size() > 0 && keep(*i, e))
            .map(|(i, e)| (e.size(), i))
            .collect();
        sizes.sort_unstable();
        sizes
    }

    fn close_sizes<'a>(
        &'a self,
        sizes: &'a [(u64, usize)],
        size: u64,
    ) -> impl Iterator<Item = usize> + 'a {
        let (low, high) = self.options.size_window(size);
        let start = sizes.partition_point(|(s, _)| *s < low);
        sizes[start..]
            .iter()
            .take_while(move |(s, _)| *s <= high)
            .filter(move |(s, _)| self.options.sizes_close(*s, size))
            .map(|(_, i)| *i)
    }

    fn pick_identity(
        &self,
        base: &TreeListing,
        candidates: &[usize],
        desired: &FileEntry,
    ) -> Option<usize> {
        if candidates.len() > 1 {
            debug!(
                "{} identical base files for {}, choosing by name",
                candidates.len(),
                desired.path.display()
            );
        }
        candidates.iter().copied().min_by_key(|&i| {
            let b = &base.entries[i];
            let mtime_differs = b.identity.mtime != desired.identity.mtime
                || b.identity.mtime_nsec != desired.identity.mtime_nsec;
            (name_distance(b.file_name(), desired.file_name()), mtime_differs, i)
        })
    }

    fn match_partial(
        &self,
        base: &TreeListing,
        desired: &TreeListing,
        pending: &BTreeMap<(u64, u64), Vec<usize>>,
        claimed: &HashSet<usize>,
    ) -> io::Result<Vec<Match>> {
        let sizes = Self::sizes(base, |i, e| !claimed.contains(&i) && e.fingerprint.is_some());
        let mut proposals = Vec::new();

        for (&group, members) in pending {
            let d = &desired.entries[members[0]];
            let Some(dfp) = d.fingerprint else { continue };

            let mut candidates: Vec<usize> = self
                .close_sizes(&sizes, d.size())
                .filter(|&bi| {
                    let b = &base.entries[bi];
                    !members.iter().any(|&m| desired.entries[m].path == b.path)
                        && self.options.coverage_reachable(b.size(), d.size())
                        && b.fingerprint.is_some_and(|bfp| ends_match(&bfp, &dfp))
                })
                .collect();
            candidates.sort_by_key(|&bi| (base.entries[bi].size().abs_diff(d.size()), bi));
            candidates.truncate(MAX_PARTIAL_CANDIDATES);

            for bi in candidates {
                let b = &base.entries[bi];
                let base_path = base.absolute(b);
                let desired_path = desired.absolute(d);

                let prefix = common_prefix_len(&base_path, &desired_path)?;
                let limit = b.size().min(d.size()) - prefix;
                let suffix = common_suffix_len(&base_path, &desired_path, limit)?;

                let covered = prefix + suffix;
                let confidence = covered as f64 / b.size().max(d.size()) as f64;
                if covered == 0
                    || confidence < self.options.min_partial_coverage
                    || confidence >= 1.0
                {
                    continue;
                }

                proposals.push(Proposal {
                    confidence,
                    group,
                    desired: members[0],
                    base: bi,
                    prefix,
                    suffix,
                });
            }
        }

        proposals.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| desired.entries[a.desired].path.cmp(&desired.entries[b.desired].path))
                .then_with(|| base.entries[a.base].path.cmp(&base.entries[b.base].path))
        });

        let mut taken = HashSet::new();
        let mut done = HashSet::new();
        let mut matches = Vec::new();

        for p in proposals {
            if done.contains(&p.group) || taken.contains(&p.base) {
                continue;
            }
            done.insert(p.group);
            taken.insert(p.base);

            let b = &base.entries[p.base];
            let target_len = desired.entries[p.desired].size();
            let mut extents = Vec::with_capacity(2);
            if p.prefix > 0 {
                extents.push(Extent {
                    src_offset: 0,
                    dst_offset: 0,
                    len: p.prefix,
                });
            }
            if p.suffix > 0 {
                extents.push(Extent {
                    src_offset: b.size() - p.suffix,
                    dst_offset: target_len - p.suffix,
                    len: p.suffix,
                });
            }

            for &m in &pending[&p.group] {
                matches.push(Match {
                    base_path: b.path.clone(),
                    target_path: desired.entries[m].path.clone(),
                    kind: MatchKind::Partial,
                    confidence: p.confidence,
                    base_len: b.size(),
                    target_len,
                    extents: extents.clone(),
                });
            }
        }

        Ok(matches)
    }
}

impl Matcher for SimilarityMatcher {
    fn fingerprints_needed(
        &self,
        base: &TreeListing,
        desired: &TreeListing,
    ) -> (Vec<usize>, Vec<usize>) {
        let base_sizes = Self::sizes(base, |_, _| true);
        let mut desired_needed = Vec::new();
        let mut base_needed = BTreeSet::new();

        for (i, d) in desired.entries.iter().enumerate() {
            if d.size() == 0 {
                continue;
            }
            if base
                .get(&d.path)
                .is_some_and(|b| b.identity.quick_eq(&d.identity))
            {
                continue;
            }

            let close: Vec<usize> = self.close_sizes(&base_sizes, d.size()).collect();
            if !close.is_empty() {
                desired_needed.push(i);
                base_needed.extend(close);
            }
        }

        (base_needed.into_iter().collect(), desired_needed)
    }

    fn match_trees(&self, base: &TreeListing, desired: &TreeListing) -> io::Result<Vec<Match>> {
        let mut by_content: HashMap<(u64, Fingerprint), Vec<usize>> = HashMap::new();
        for (i, b) in base.entries.iter().enumerate() {
            match b.fingerprint {
                Some(fp) if b.size() > 0 => by_content.entry((b.size(), fp)).or_default().push(i),
                _ => {}
            }
        }

        let mut matches = Vec::new();
        let mut claimed = HashSet::new();
        let mut identity_by_inode: HashMap<(u64, u64), Option<usize>> = HashMap::new();
        let mut pending: BTreeMap<(u64, u64), Vec<usize>> = BTreeMap::new();

        for (di, d) in desired.entries.iter().enumerate() {
            if d.size() == 0 {
                continue;
            }
            if base.get(&d.path).is_some_and(|b| unchanged(b, d)) {
                continue;
            }
            let Some(fp) = d.fingerprint else { continue };

            let group = d.identity.inode_key();
            let chosen = *identity_by_inode.entry(group).or_insert_with(|| {
                by_content
                    .get(&(d.size(), fp))
                    .and_then(|candidates| self.pick_identity(base, candidates, d))
            });

            match chosen {
                Some(bi) => {
                    claimed.insert(bi);
                    matches.push(Match::whole_file(
                        base.entries[bi].path.clone(),
                        d.path.clone(),
                        d.size(),
                    ));
                }
                None => pending.entry(group).or_default().push(di),
            }
        }

        matches.extend(self.match_partial(base, desired, &pending, &claimed)?);
        matches.sort_by(|a, b| a.target_path.cmp(&b.target_path));
        Ok(matches)
    }
}

fn unchanged(base: &FileEntry, desired: &FileEntry) -> bool {
    base.size() == desired.size()
        && (base.identity.quick_eq(&desired.identity)
            || (base.fingerprint.is_some() && base.fingerprint == desired.fingerprint))
}

/// Windows too far apart to compare leave the pair to the byte-exact check.
fn ends_match(a: &Fingerprint, b: &Fingerprint) -> bool {
    match (a.head_matches(b), a.tail_matches(b)) {
        (Some(head), Some(tail)) => head || tail,
        _ => true,
    }
}

/// Levenshtein distance between two file names.
fn name_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut prev = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == *cb { 0 } else { 1 };
            let next = (row[j + 1] + 1).min(row[j] + 1).min(prev + cost);
            prev = row[j + 1];
            row[j + 1] = next;
        }
    }

    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{scan_tree, WalkOptions};
    use crate::matcher::prepare_listings;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8)
            .collect()
    }

    async fn run(base: &Path, desired: &Path) -> io::Result<Vec<Match>> {
        let matcher = SimilarityMatcher::default();
        let mut base = scan_tree(base, &WalkOptions::default())?;
        let mut desired = scan_tree(desired, &WalkOptions::default())?;
        prepare_listings(&matcher, &mut base, &mut desired, 65536, 4).await?;
        matcher.match_trees(&base, &desired)
    }

    fn dirs() -> io::Result<(TempDir, PathBuf, PathBuf)> {
        let temp = TempDir::new()?;
        let base = temp.path().join("base");
        let desired = temp.path().join("desired");
        fs::create_dir(&base)?;
        fs::create_dir(&desired)?;
        Ok((temp, base, desired))
    }

    #[test]
    fn test_name_distance() {
        assert_eq!(name_distance("a.txt", "a.txt"), 0);
        assert_eq!(name_distance("a.txt", "b.txt"), 1);
        assert_eq!(name_distance("", "abc"), 3);
        assert_eq!(name_distance("kitten", "sitting"), 3);
    }

    #[test]
    fn test_size_window_contains_close_sizes() {
        let options = MatcherOptions::default();
        for size in [1u64, 100, 4096, 1_000_000, 50_000_000] {
            let (low, high) = options.size_window(size);
            for other in [size.saturating_sub(4096), size + 4096, size + size / 100] {
                if options.sizes_close(size, other) {
                    assert!(low <= other && other <= high, "{} vs {}", size, other);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_appended_file_matches_across_window_sizes() -> io::Result<()> {
        // 8000 -> 8100 keeps the window; the others cross into the next one
        for (old, new) in [(8000usize, 8100usize), (8190, 8290), (262_000, 263_000)] {
            let (_temp, base, desired) = dirs()?;
            let data = pattern(new, 11);
            fs::write(base.join("app.log"), &data[..old])?;
            fs::write(desired.join("app.log.1"), &data)?;

            let matches = run(&base, &desired).await?;

            assert_eq!(matches.len(), 1, "{} -> {}", old, new);
            assert_eq!(matches[0].kind, MatchKind::Partial);
            assert_eq!(matches[0].base_path, PathBuf::from("app.log"));
            assert_eq!(
                matches[0].extents,
                vec![Extent {
                    src_offset: 0,
                    dst_offset: 0,
                    len: old as u64,
                }]
            );
        }
        Ok(())
    }

    #[test]
    fn test_coverage_reachable() {
        let options = MatcherOptions::default();
        assert!(options.coverage_reachable(1000, 1900));
        assert!(!options.coverage_reachable(100, 3000));
    }

    #[tokio::test]
    async fn test_rename_is_identity_match() -> io::Result<()> {
        let (_temp, base, desired) = dirs()?;
        fs::write(base.join("a.txt"), pattern(3000, 1))?;
        fs::write(desired.join("b.txt"), pattern(3000, 1))?;

        let matches = run(&base, &desired).await?;

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].base_path, PathBuf::from("a.txt"));
        assert_eq!(matches[0].target_path, PathBuf::from("b.txt"));
        assert_eq!(matches[0].kind, MatchKind::Identity);
        assert_eq!(matches[0].confidence, 1.0);
        assert_eq!(matches[0].matched_bytes(), 3000);
        Ok(())
    }

    #[tokio::test]
    async fn test_unchanged_path_needs_nothing() -> io::Result<()> {
        let (_temp, base, desired) = dirs()?;
        fs::write(base.join("same.bin"), pattern(5000, 2))?;
        fs::write(desired.join("same.bin"), pattern(5000, 2))?;

        assert!(run(&base, &desired).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_middle_edit_is_partial_match() -> io::Result<()> {
        let (_temp, base, desired) = dirs()?;
        let original = pattern(1000, 3);
        let mut edited = original.clone();
        for b in &mut edited[500..520] {
            *b = !*b;
        }
        fs::write(base.join("f.bin"), &original)?;
        fs::write(desired.join("g.bin"), &edited)?;

        let matches = run(&base, &desired).await?;

        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.kind, MatchKind::Partial);
        assert!(m.confidence < 1.0);
        assert!((m.confidence - 0.98).abs() < 1e-9);
        assert_eq!(
            m.extents,
            vec![
                Extent { src_offset: 0, dst_offset: 0, len: 500 },
                Extent { src_offset: 520, dst_offset: 520, len: 480 },
            ]
        );
        assert_eq!(m.uncovered(), vec![500..520]);
        Ok(())
    }

    #[tokio::test]
    async fn test_appended_file_keeps_prefix() -> io::Result<()> {
        let (_temp, base, desired) = dirs()?;
        let original = pattern(8000, 4);
        let mut grown = original.clone();
        grown.extend_from_slice(b"appended log line\n");
        fs::write(base.join("app.log"), &original)?;
        fs::write(desired.join("app.log.1"), &grown)?;

        let matches = run(&base, &desired).await?;

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].extents.len(), 1);
        assert_eq!(matches[0].extents[0].len, 8000);
        assert_eq!(matches[0].target_len, grown.len() as u64);
        Ok(())
    }

    #[tokio::test]
    async fn test_same_path_edit_left_to_transfer() -> io::Result<()> {
        let (_temp, base, desired) = dirs()?;
        let original = pattern(1000, 5);
        let mut edited = original.clone();
        edited[10] ^= 0xff;
        fs::write(base.join("f.bin"), &original)?;
        fs::write(desired.join("f.bin"), &edited)?;

        assert!(run(&base, &desired).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_low_coverage_rejected() -> io::Result<()> {
        let (_temp, base, desired) = dirs()?;
        let original = pattern(1000, 6);
        let mut edited = pattern(1000, 7);
        edited[..200].copy_from_slice(&original[..200]);
        fs::write(base.join("f.bin"), &original)?;
        fs::write(desired.join("g.bin"), &edited)?;

        assert!(run(&base, &desired).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_length_files_never_match() -> io::Result<()> {
        let (_temp, base, desired) = dirs()?;
        fs::write(base.join("empty"), b"")?;
        fs::write(desired.join("also-empty"), b"")?;

        assert!(run(&base, &desired).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicates_reuse_one_base_file() -> io::Result<()> {
        let (_temp, base, desired) = dirs()?;
        fs::write(base.join("x.dat"), pattern(2048, 8))?;
        fs::write(desired.join("copy1.dat"), pattern(2048, 8))?;
        fs::write(desired.join("copy2.dat"), pattern(2048, 8))?;

        let matches = run(&base, &desired).await?;

        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.base_path == Path::new("x.dat")));
        assert_eq!(matches[0].target_path, PathBuf::from("copy1.dat"));
        assert_eq!(matches[1].target_path, PathBuf::from("copy2.dat"));
        Ok(())
    }

    #[tokio::test]
    async fn test_identity_prefers_similar_name() -> io::Result<()> {
        let (_temp, base, desired) = dirs()?;
        fs::write(base.join("aaaa.bin"), pattern(4096, 9))?;
        fs::write(base.join("report.txt"), pattern(4096, 9))?;
        fs::write(desired.join("report-final.txt"), pattern(4096, 9))?;

        let matches = run(&base, &desired).await?;

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].base_path, PathBuf::from("report.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn test_base_claimed_by_one_partial_match() -> io::Result<()> {
        let (_temp, base, desired) = dirs()?;
        let original = pattern(1000, 10);
        let mut close = original.clone();
        close[900] ^= 0xff;
        let mut far = original.clone();
        for b in &mut far[300..340] {
            *b ^= 0xff;
        }
        fs::write(base.join("orig.bin"), &original)?;
        fs::write(desired.join("close.bin"), &close)?;
        fs::write(desired.join("far.bin"), &far)?;

        let matches = run(&base, &desired).await?;

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].target_path, PathBuf::from("close.bin"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unrelated_sizes_are_not_fingerprinted() -> io::Result<()> {
        let (_temp, base, desired) = dirs()?;
        fs::write(base.join("small"), pattern(100, 11))?;
        fs::write(desired.join("large"), pattern(100_000, 11))?;

        let matcher = SimilarityMatcher::default();
        let mut base = scan_tree(&base, &WalkOptions::default())?;
        let mut desired = scan_tree(&desired, &WalkOptions::default())?;
        let read = prepare_listings(&matcher, &mut base, &mut desired, 65536, 2).await?;

        assert_eq!(read, 0);
        assert!(matcher.match_trees(&base, &desired)?.is_empty());
        Ok(())
    }
}

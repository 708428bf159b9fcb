//! Cheap content fingerprints and byte-exact prefix/suffix comparison.
//!
//! A fingerprint hashes a head window, a tail window and a body sample of the
//! file with xxhash64. The window scales with the file (a quarter of it,
//! rounded down to a power of two, capped by the configured maximum) so that
//! small files still get distinct head and tail hashes. Both ends are also
//! hashed at half the window, so files whose windows differ by one step still
//! compare on the smaller one. The body covers the whole content of files up
//! to 1 MiB and evenly spaced samples beyond that.

use crate::fs::TreeListing;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::hash::Hasher;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use twox_hash::XxHash64;

const COMPARE_CHUNK: usize = 64 * 1024;
const FULL_HASH_LIMIT: u64 = 1024 * 1024;
const SAMPLE_COUNT: u64 = 16;
const SAMPLE_LEN: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint {
    /// Window size in bytes
    pub window: u64,
    pub head: u64,
    pub tail: u64,
    /// First and last `window / 2` bytes
    pub head_half: u64,
    pub tail_half: u64,
    pub body: u64,
}

impl Fingerprint {
    /// Fingerprint the file at `path`, which must be `size` bytes long.
    pub fn compute(path: &Path, size: u64, max_window: u64) -> io::Result<Self> {
        let window = window_for(size, max_window);
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; window as usize];

        let half = (window / 2) as usize;

        file.read_exact(&mut buf)?;
        let head = hash64(&buf);
        let head_half = hash64(&buf[..half]);

        file.seek(SeekFrom::Start(size - window))?;
        file.read_exact(&mut buf)?;
        let tail = hash64(&buf);
        let tail_half = hash64(&buf[buf.len() - half..]);

        let body = body_hash(&mut file, size)?;

        Ok(Self {
            window,
            head,
            tail,
            head_half,
            tail_half,
            body,
        })
    }

    /// Whether both files start with the same bytes over their common window.
    ///
    /// `None` when the windows are more than one step apart and the hashes
    /// cannot tell.
    pub fn head_matches(&self, other: &Fingerprint) -> Option<bool> {
        self.on_common_window(other, |f| f.head, |f| f.head_half)
    }

    /// Same as [`Fingerprint::head_matches`] for the last bytes.
    pub fn tail_matches(&self, other: &Fingerprint) -> Option<bool> {
        self.on_common_window(other, |f| f.tail, |f| f.tail_half)
    }

    fn on_common_window(
        &self,
        other: &Fingerprint,
        full: fn(&Fingerprint) -> u64,
        half: fn(&Fingerprint) -> u64,
    ) -> Option<bool> {
        if self.window == other.window {
            Some(full(self) == full(other))
        } else if self.window == other.window * 2 {
            Some(half(self) == full(other))
        } else if other.window == self.window * 2 {
            Some(full(self) == half(other))
        } else {
            None
        }
    }
}

/// Window hashed at each end of a file of `size` bytes.
pub fn window_for(size: u64, max_window: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    let quarter = (size / 4).max(1);
    let pow2 = 1u64 << (63 - quarter.leading_zeros());
    pow2.min(max_window).max(1)
}

fn body_hash(file: &mut File, size: u64) -> io::Result<u64> {
    let mut h = XxHash64::with_seed(0);

    if size <= FULL_HASH_LIMIT {
        let mut data = Vec::with_capacity(size as usize);
        file.seek(SeekFrom::Start(0))?;
        file.take(size).read_to_end(&mut data)?;
        if data.len() as u64 != size {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file shrank while hashing"));
        }
        h.write(&data);
        return Ok(h.finish());
    }

    let mut buf = vec![0u8; SAMPLE_LEN as usize];
    for i in 0..SAMPLE_COUNT {
        let offset = (size - SAMPLE_LEN) * i / (SAMPLE_COUNT - 1);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        h.write(&buf);
    }
    Ok(h.finish())
}

fn hash64(data: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(data);
    h.finish()
}

/// Number of leading bytes `a` and `b` have in common.
pub fn common_prefix_len(a: &Path, b: &Path) -> io::Result<u64> {
    let mut fa = File::open(a)?;
    let mut fb = File::open(b)?;
    let len = fa.metadata()?.len().min(fb.metadata()?.len());

    let mut buf_a = vec![0u8; COMPARE_CHUNK];
    let mut buf_b = vec![0u8; COMPARE_CHUNK];
    let mut pos = 0u64;

    while pos < len {
        let n = (len - pos).min(COMPARE_CHUNK as u64) as usize;
        fa.read_exact(&mut buf_a[..n])?;
        fb.read_exact(&mut buf_b[..n])?;

        if let Some(i) = first_mismatch(&buf_a[..n], &buf_b[..n]) {
            return Ok(pos + i as u64);
        }
        pos += n as u64;
    }

    Ok(len)
}

/// Number of trailing bytes `a` and `b` have in common, at most `limit`.
pub fn common_suffix_len(a: &Path, b: &Path, limit: u64) -> io::Result<u64> {
    let mut fa = File::open(a)?;
    let mut fb = File::open(b)?;
    let len_a = fa.metadata()?.len();
    let len_b = fb.metadata()?.len();
    let limit = limit.min(len_a).min(len_b);

    let mut buf_a = vec![0u8; COMPARE_CHUNK];
    let mut buf_b = vec![0u8; COMPARE_CHUNK];
    let mut matched = 0u64;

    while matched < limit {
        let n = (limit - matched).min(COMPARE_CHUNK as u64) as usize;
        fa.seek(SeekFrom::Start(len_a - matched - n as u64))?;
        fb.seek(SeekFrom::Start(len_b - matched - n as u64))?;
        fa.read_exact(&mut buf_a[..n])?;
        fb.read_exact(&mut buf_b[..n])?;

        // Compare back to front within the chunk
        let equal_tail = buf_a[..n]
            .iter()
            .rev()
            .zip(buf_b[..n].iter().rev())
            .take_while(|(x, y)| x == y)
            .count();

        matched += equal_tail as u64;
        if equal_tail < n {
            break;
        }
    }

    Ok(matched)
}

fn first_mismatch(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter().zip(b).position(|(x, y)| x != y)
}

/// Fingerprint the listed entries at `indices`, at most `jobs` files at a time.
///
/// Entries sharing an inode are hardlinks of the same data and are read once.
/// Zero-length files and entries that already carry a fingerprint are skipped.
/// Returns the number of files actually read.
pub async fn fingerprint_entries(
    listing: &mut TreeListing,
    indices: &[usize],
    max_window: u64,
    jobs: usize,
) -> io::Result<usize> {
    let mut groups: BTreeMap<(u64, u64), Vec<usize>> = BTreeMap::new();
    for &i in indices {
        let entry = &listing.entries[i];
        if entry.fingerprint.is_some() || entry.size() == 0 {
            continue;
        }
        groups.entry(entry.identity.inode_key()).or_default().push(i);
    }

    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let mut handles = Vec::with_capacity(groups.len());

    for members in groups.into_values() {
        let first = &listing.entries[members[0]];
        let path = listing.absolute(first);
        let size = first.size();
        let sem = Arc::clone(&semaphore);

        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.map_err(io::Error::other)?;
            let fingerprint = tokio::task::spawn_blocking(move || {
                Fingerprint::compute(&path, size, max_window)
                    .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))
            })
            .await
            .map_err(io::Error::other)??;
            Ok::<_, io::Error>((members, fingerprint))
        }));
    }

    let read = handles.len();
    for handle in handles {
        let (members, fingerprint) = handle.await.map_err(io::Error::other)??;
        for i in members {
            listing.entries[i].fingerprint = Some(fingerprint);
        }
    }

    Ok(read)
}

//! Mirror scheduling: which missing snapshot to build next, and from which
//! already-mirrored base.
//!
//! The plan is recomputed from the two snapshot sets on every call; nothing
//! about earlier runs is remembered.

use crate::snapshot::{merge, Snapshot, SnapshotLabel, SnapshotSet};
use crate::utils::MirrorError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// How far apart two labels are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Number of positions in the merged, label-ordered snapshot sequence
    #[default]
    Positions,
    /// Calendar days between `YYYY-MM-DD` labels
    Days,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Report the plan without mutating anything; `single` stops after one step
    DryRun { single: bool },
    /// Execute exactly one step
    Single,
    /// Execute steps until nothing is missing
    Full,
}

/// One unit of work: build `target` on the mirror starting from `base`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncPlanStep {
    pub base: SnapshotLabel,
    pub target: SnapshotLabel,
    pub distance: u64,
    /// The target already exists on the mirror as an unfinished staged snapshot
    pub resume: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Planner {
    pub metric: DistanceMetric,
    /// Multiplier on the distance when the base is older than the candidate
    pub forward_weight: u64,
}

impl Default for Planner {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::Positions,
            forward_weight: 1,
        }
    }
}

/// Plan with the default metric (positions, no forward penalty).
pub fn plan_next(
    source: &SnapshotSet,
    target: &SnapshotSet,
) -> Result<Option<SyncPlanStep>, MirrorError> {
    Planner::default().plan_next(source, target)
}

impl Planner {
    pub fn new(metric: DistanceMetric, forward_weight: u64) -> Self {
        Self {
            metric,
            forward_weight: forward_weight.max(1),
        }
    }

    /// Pick the missing snapshot closest to a finalized target snapshot.
    ///
    /// Ties between an older and a newer base resolve to the newer base.
    /// Ties between candidates resolve to the oldest candidate label.
    pub fn plan_next(
        &self,
        source: &SnapshotSet,
        target: &SnapshotSet,
    ) -> Result<Option<SyncPlanStep>, MirrorError> {
        let merged = merge(source, target);

        let bases: Vec<usize> = merged
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_base_eligible())
            .map(|(i, _)| i)
            .collect();

        if bases.is_empty() {
            return Err(MirrorError::Configuration(
                "no finalized snapshot on the target; the first snapshot must be mirrored manually"
                    .to_string(),
            ));
        }

        if self.metric == DistanceMetric::Days {
            if let Some(bad) = merged.iter().find(|s| s.label.to_date().is_none()) {
                return Err(MirrorError::Configuration(format!(
                    "label {} is not a YYYY-MM-DD date, required by the days distance metric",
                    bad.label
                )));
            }
        }

        let mut best: Option<(u64, usize, usize)> = None;
        let mut tied = 0usize;

        for (i, candidate) in merged.iter().enumerate().filter(|(_, s)| s.is_missing()) {
            let Some((distance, base)) = self.nearest_base(&merged, &bases, i) else {
                continue;
            };

            match best {
                Some((d, _, _)) if distance > d => {}
                Some((d, _, _)) if distance == d => tied += 1,
                _ => {
                    best = Some((distance, i, base));
                    tied = 0;
                }
            }

            debug!(
                label = %candidate.label,
                base = %merged[base].label,
                distance,
                "Candidate"
            );
        }

        let Some((distance, i, base)) = best else {
            return Ok(None);
        };

        if tied > 0 {
            info!(
                label = %merged[i].label,
                distance,
                tied,
                "Several snapshots equally close to the mirror, taking the oldest"
            );
        }

        Ok(Some(SyncPlanStep {
            base: merged[base].label.clone(),
            target: merged[i].label.clone(),
            distance,
            resume: merged[i].exists_in_target,
        }))
    }

    /// Nearest base on either side of position `i`, preferring the newer on a tie.
    fn nearest_base(&self, merged: &[Snapshot], bases: &[usize], i: usize) -> Option<(u64, usize)> {
        let older = bases.iter().rev().copied().find(|&j| j < i);
        let newer = bases.iter().copied().find(|&j| j > i);

        let older = older.map(|j| (self.distance(merged, i, j), j));
        let newer = newer.map(|j| (self.distance(merged, i, j), j));

        match (older, newer) {
            (Some(o), Some(n)) => {
                if n.0 == o.0 {
                    info!(
                        label = %merged[i].label,
                        older = %merged[o.1].label,
                        newer = %merged[n.1].label,
                        "Bases equidistant, building backward from the newer one"
                    );
                }
                Some(if n.0 <= o.0 { n } else { o })
            }
            (o, n) => o.or(n),
        }
    }

    fn distance(&self, merged: &[Snapshot], candidate: usize, base: usize) -> u64 {
        let raw = match self.metric {
            DistanceMetric::Positions => candidate.abs_diff(base) as u64,
            DistanceMetric::Days => {
                // Both parse, checked in plan_next
                let c = merged[candidate].label.to_date();
                let b = merged[base].label.to_date();
                match (c, b) {
                    (Some(c), Some(b)) => (c - b).num_days().unsigned_abs(),
                    _ => candidate.abs_diff(base) as u64,
                }
            }
        };

        if base < candidate {
            raw * self.forward_weight
        } else {
            raw
        }
    }
}

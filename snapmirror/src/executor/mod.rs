//! Step executor: builds one snapshot on the mirror.
//!
//! create writable snapshot -> scan -> match -> clone -> transfer -> finalize
//!
//! Stages run strictly in order; cancellation is checked between them. A
//! cancelled or failed step leaves the staged snapshot writable, and the
//! next run resumes it.

use crate::config::Config;
use crate::extent::{apply_concurrently, AppliedCount, CloneEngine};
use crate::fs::{scan_tree, TreeListing, WalkOptions};
use crate::matcher::{prepare_listings, Match, MatchStats, Matcher};
use crate::scheduler::SyncPlanStep;
use crate::snapshot::volume::VolumeOps;
use crate::transfer::{TransferInvoker, TransferStats};
use crate::utils::format::{format_bytes, format_duration};
use crate::utils::{EngineError, MirrorError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where the snapshot trees live.
#[derive(Debug, Clone)]
pub struct Roots {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Tuning shared by every step of a run.
#[derive(Debug, Clone)]
pub struct StepSettings {
    /// Walk options for the matching scans
    pub walk: WalkOptions,
    pub fingerprint_window: u64,
    pub clone_threshold: f64,
    pub jobs: usize,
}

impl StepSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            walk: WalkOptions {
                exclude_patterns: config.matcher.exclude.clone(),
                ..WalkOptions::default()
            },
            fingerprint_window: config.matcher.fingerprint_window,
            clone_threshold: config.engine.clone_threshold,
            jobs: config.performance.jobs.max(1),
        }
    }
}

/// Matches planned for one step, computed from read-only scans.
#[derive(Debug, Clone)]
pub struct MatchPlan {
    /// Tree the base listing was read from
    pub base_listing: PathBuf,
    pub matches: Vec<Match>,
    pub stats: MatchStats,
    /// Bytes covered by matches at or above the clone threshold
    pub clonable_bytes: u64,
    /// Files fingerprinted to produce the matches
    pub fingerprinted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub matches: MatchStats,
    pub clonable_bytes: u64,
    pub applied: AppliedCount,
    pub transfer: TransferStats,
    pub duration_secs: u64,
}

pub struct StepExecutor {
    roots: Roots,
    volume: Arc<dyn VolumeOps>,
    matcher: Arc<dyn Matcher>,
    engine: Arc<dyn CloneEngine>,
    invoker: TransferInvoker,
    settings: StepSettings,
    cancel: CancellationToken,
}

impl StepExecutor {
    pub fn new(
        roots: Roots,
        volume: Arc<dyn VolumeOps>,
        matcher: Arc<dyn Matcher>,
        engine: Arc<dyn CloneEngine>,
        invoker: TransferInvoker,
        settings: StepSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            roots,
            volume,
            matcher,
            engine,
            invoker,
            settings,
            cancel,
        }
    }

    pub fn roots(&self) -> &Roots {
        &self.roots
    }

    /// Run one step to completion.
    pub async fn execute(&self, step: &SyncPlanStep) -> Result<StepOutcome> {
        let started = Instant::now();
        let base_root = self.roots.target.join(step.base.as_str());
        let staged_root = self.roots.target.join(step.target.as_str());
        let desired_root = self.roots.source.join(step.target.as_str());

        info!(
            base = %step.base,
            label = %step.target,
            distance = step.distance,
            resume = step.resume,
            "Starting step"
        );

        if step.resume {
            info!(label = %step.target, "Resuming staged snapshot");
        } else {
            let volume = Arc::clone(&self.volume);
            let (base, staged) = (base_root.clone(), staged_root.clone());
            tokio::task::spawn_blocking(move || {
                volume.create_writable_snapshot(&base, &staged)?;
                volume.sync(&staged)
            })
            .await
            .map_err(join_error)??;
        }
        self.check_cancelled()?;

        let plan = self.plan_matches(step).await?;
        info!(
            label = %step.target,
            identity = plan.stats.identity_matches,
            partial = plan.stats.partial_matches,
            fingerprinted = plan.fingerprinted,
            "Matching complete"
        );
        self.check_cancelled()?;

        if !staged_root.is_dir() {
            return Err(EngineError::StagedTreeMissing(staged_root).into());
        }
        if !base_root.is_dir() {
            return Err(EngineError::BaseTreeMissing(base_root).into());
        }

        let applied = apply_concurrently(
            Arc::clone(&self.engine),
            plan.matches,
            base_root,
            staged_root.clone(),
            self.settings.jobs.max(1),
            &self.cancel,
        )
        .await?;

        if applied.unsupported > 0 {
            warn!(
                label = %step.target,
                unsupported = applied.unsupported,
                "Some clones were refused, those files are transferred in full"
            );
        }
        info!(
            label = %step.target,
            applied = applied.applied,
            cloned = %format_bytes(applied.cloned_bytes),
            "Clones applied"
        );
        self.check_cancelled()?;

        let transfer = self
            .invoker
            .sync(&step.target, desired_root, staged_root, &self.cancel)
            .await?;

        let elapsed = started.elapsed();
        info!(
            label = %step.target,
            duration = %format_duration(elapsed.as_secs()),
            "Step complete"
        );

        Ok(StepOutcome {
            matches: plan.stats,
            clonable_bytes: plan.clonable_bytes,
            applied,
            transfer,
            duration_secs: elapsed.as_secs(),
        })
    }

    /// Scan, fingerprint and match the trees of `step` without touching the mirror.
    ///
    /// The base listing comes from the source volume when the base still
    /// exists there, otherwise from its finalized copy on the mirror.
    pub async fn plan_matches(&self, step: &SyncPlanStep) -> Result<MatchPlan> {
        let source_base = self.roots.source.join(step.base.as_str());
        let base_listing = if source_base.is_dir() {
            source_base
        } else {
            self.roots.target.join(step.base.as_str())
        };
        let desired_root = self.roots.source.join(step.target.as_str());

        let walk = self.settings.walk.clone();
        let (base_path, desired_path) = (base_listing.clone(), desired_root.clone());
        let (mut base, mut desired) = tokio::task::spawn_blocking(move || {
            let base = scan(&base_path, &walk)?;
            let desired = scan(&desired_path, &walk)?;
            Ok::<_, MirrorError>((base, desired))
        })
        .await
        .map_err(join_error)??;

        let fingerprinted = prepare_listings(
            self.matcher.as_ref(),
            &mut base,
            &mut desired,
            self.settings.fingerprint_window,
            self.settings.jobs.max(1),
        )
        .await
        .map_err(|source| MirrorError::Scan {
            path: desired_root,
            source,
        })?;

        let matcher = Arc::clone(&self.matcher);
        let (matches, stats) = tokio::task::spawn_blocking(move || {
            let matches = matcher
                .match_trees(&base, &desired)
                .map_err(|source| MirrorError::Scan {
                    path: desired.root.clone(),
                    source,
                })?;
            let stats = MatchStats::from_matches(&desired, &matches);
            Ok::<_, MirrorError>((matches, stats))
        })
        .await
        .map_err(join_error)??;

        let clonable_bytes = MatchStats::clonable_bytes(&matches, self.settings.clone_threshold);

        Ok(MatchPlan {
            base_listing,
            matches,
            stats,
            clonable_bytes,
            fingerprinted,
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        Ok(())
    }
}

fn scan(root: &Path, walk: &WalkOptions) -> Result<TreeListing> {
    scan_tree(root, walk).map_err(|source| MirrorError::Scan {
        path: root.to_path_buf(),
        source,
    })
}

fn join_error(e: JoinError) -> MirrorError {
    MirrorError::Io(std::io::Error::other(e))
}

//! Top-level run loop: read both snapshot sets, plan, execute, repeat.

use crate::config::Config;
use crate::executor::{MatchPlan, Roots, StepExecutor, StepOutcome, StepSettings};
use crate::extent::{AppliedCount, EngineOptions, ReflinkEngine};
use crate::matcher::{MatchStats, MatcherOptions, SimilarityMatcher};
use crate::scheduler::{Planner, RunMode, SyncPlanStep};
use crate::snapshot::volume::{BtrfsVolume, VolumeOps};
use crate::snapshot::{read_set, SnapshotLabel, SnapshotSet};
use crate::transfer::{RsyncTransfer, TransferInvoker, TransferStats};
use crate::utils::format::{format_bytes, percent};
use crate::utils::{MirrorError, Result};
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub base: SnapshotLabel,
    pub target: SnapshotLabel,
    pub distance: u64,
    pub resume: bool,
    pub matches: MatchStats,
    pub clonable_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<AppliedCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

impl StepReport {
    fn planned(step: SyncPlanStep, plan: &MatchPlan) -> Self {
        Self {
            base: step.base,
            target: step.target,
            distance: step.distance,
            resume: step.resume,
            matches: plan.stats.clone(),
            clonable_bytes: plan.clonable_bytes,
            applied: None,
            transfer: None,
            duration_secs: None,
        }
    }

    fn executed(step: SyncPlanStep, outcome: StepOutcome) -> Self {
        Self {
            base: step.base,
            target: step.target,
            distance: step.distance,
            resume: step.resume,
            matches: outcome.matches,
            clonable_bytes: outcome.clonable_bytes,
            applied: Some(outcome.applied),
            transfer: Some(outcome.transfer),
            duration_secs: Some(outcome.duration_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: &'static str,
    pub steps: Vec<StepReport>,
    /// Nothing left to mirror after the run (for dry runs: after the planned steps)
    pub converged: bool,
}

impl RunSummary {
    /// Human-readable report for stdout.
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        if self.steps.is_empty() {
            let _ = writeln!(out, "{}: nothing to mirror", self.mode);
            return out;
        }

        let _ = writeln!(
            out,
            "{}: {} step(s){}",
            self.mode,
            self.steps.len(),
            if self.converged { ", converged" } else { "" }
        );

        for step in &self.steps {
            let _ = write!(
                out,
                "  {} -> {}{} (distance {}): {} identity, {} partial, {} clonable ({:.0}%)",
                step.base,
                step.target,
                if step.resume { " [resume]" } else { "" },
                step.distance,
                step.matches.identity_matches,
                step.matches.partial_matches,
                format_bytes(step.clonable_bytes),
                percent(step.clonable_bytes, step.matches.desired_bytes),
            );
            if let Some(applied) = &step.applied {
                let _ = write!(
                    out,
                    ", {} cloned, {} refused",
                    applied.applied, applied.unsupported
                );
            }
            if let Some(literal) = step.transfer.as_ref().and_then(|t| t.literal_bytes) {
                let _ = write!(out, ", {} transferred", format_bytes(literal));
            }
            out.push('\n');
        }

        out
    }
}

pub struct Mirror {
    volume: Arc<dyn VolumeOps>,
    planner: Planner,
    executor: StepExecutor,
    cancel: CancellationToken,
}

impl Mirror {
    pub fn new(
        volume: Arc<dyn VolumeOps>,
        planner: Planner,
        executor: StepExecutor,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            volume,
            planner,
            executor,
            cancel,
        }
    }

    /// Production wiring: btrfs volume, FICLONE clones, rsync transfer.
    pub fn from_config(config: &Config, roots: Roots, cancel: CancellationToken) -> Self {
        let volume: Arc<dyn VolumeOps> = Arc::new(BtrfsVolume::new(&config.volume.btrfs));
        let invoker = TransferInvoker::new(
            Arc::new(RsyncTransfer::from_config(&config.transfer)),
            Arc::clone(&volume),
        );

        let executor = StepExecutor::new(
            roots,
            Arc::clone(&volume),
            Arc::new(SimilarityMatcher::new(MatcherOptions::from(&config.matcher))),
            Arc::new(ReflinkEngine::new(EngineOptions::from(&config.engine))),
            invoker,
            StepSettings::from_config(config),
            cancel.clone(),
        );

        let planner = Planner::new(config.mirror.distance, config.mirror.forward_weight);
        Self::new(volume, planner, executor, cancel)
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunSummary> {
        match mode {
            RunMode::DryRun { single } => self.dry_run(single).await,
            RunMode::Single => self.execute("single", Some(1)).await,
            RunMode::Full => self.execute("full", None).await,
        }
    }

    /// Plan every step the run would take, virtually finalizing each target.
    /// Only read-only scans are performed.
    async fn dry_run(&self, single: bool) -> Result<RunSummary> {
        let (source, mut target) = self.read_sets().await?;
        self.warn_orphans(&source, &target);

        let mut steps = Vec::new();
        let converged = loop {
            let Some(step) = self.planner.plan_next(&source, &target)? else {
                break true;
            };
            if single && !steps.is_empty() {
                break false;
            }
            self.check_cancelled()?;

            let plan = self.executor.plan_matches(&step).await?;
            target.mark_finalized(&step.target);
            steps.push(StepReport::planned(step, &plan));
        };

        Ok(RunSummary {
            mode: "dry-run",
            steps,
            converged,
        })
    }

    async fn execute(&self, mode: &'static str, limit: Option<usize>) -> Result<RunSummary> {
        let mut steps = Vec::new();
        let mut first = true;

        let converged = loop {
            self.check_cancelled()?;

            let (source, target) = self.read_sets().await?;
            if first {
                self.warn_orphans(&source, &target);
                first = false;
            }

            let Some(step) = self.planner.plan_next(&source, &target)? else {
                break true;
            };
            if limit.is_some_and(|limit| steps.len() >= limit) {
                break false;
            }

            let outcome = self.executor.execute(&step).await?;
            steps.push(StepReport::executed(step, outcome));
        };

        if converged {
            info!(steps = steps.len(), "Mirror is up to date");
        }

        Ok(RunSummary {
            mode,
            steps,
            converged,
        })
    }

    /// Source snapshots count as finalized; target read-only state is probed.
    async fn read_sets(&self) -> Result<(SnapshotSet, SnapshotSet)> {
        let volume = Arc::clone(&self.volume);
        let roots = self.executor.roots().clone();

        tokio::task::spawn_blocking(move || {
            let source = read_set(volume.as_ref(), &roots.source, false)?;
            let target = read_set(volume.as_ref(), &roots.target, true)?;
            Ok::<_, MirrorError>((source, target))
        })
        .await
        .map_err(|e| MirrorError::Io(std::io::Error::other(e)))?
    }

    fn warn_orphans(&self, source: &SnapshotSet, target: &SnapshotSet) {
        for label in target.labels() {
            if !target.is_finalized(label) && !source.contains(label) {
                warn!(
                    label = %label,
                    "Staged snapshot on the mirror has no source counterpart, ignoring it"
                );
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        Ok(())
    }
}

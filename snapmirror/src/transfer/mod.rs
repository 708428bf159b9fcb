//! Transfer invoker: delta-transfers the remaining differences into the
//! staged tree, then finalizes the staged snapshot read-only.

pub mod rsync;

pub use rsync::{parse_literal_bytes, RsyncTransfer};

use crate::snapshot::volume::VolumeOps;
use crate::snapshot::SnapshotLabel;
use crate::utils::{MirrorError, Result, TransferError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// What the delta transfer reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransferStats {
    /// Bytes written that did not come from the staged file (rsync "Literal data")
    pub literal_bytes: Option<u64>,
    /// Bytes found in place in the staged file (rsync "Matched data")
    pub matched_bytes: Option<u64>,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// External delta-transfer mechanism.
///
/// Must mutate staged files in place and always compute deltas, so that
/// extents outside the changed ranges stay shared.
pub trait DeltaTransfer: Send + Sync {
    /// Make `staged` an exact copy of `desired`. Returns early with
    /// [`TransferError::Cancelled`] once `cancel` fires.
    fn sync(
        &self,
        desired: &Path,
        staged: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<TransferStats, TransferError>;
}

pub struct TransferInvoker {
    transfer: Arc<dyn DeltaTransfer>,
    volume: Arc<dyn VolumeOps>,
}

impl TransferInvoker {
    pub fn new(transfer: Arc<dyn DeltaTransfer>, volume: Arc<dyn VolumeOps>) -> Self {
        Self { transfer, volume }
    }

    /// Transfer `desired` into `staged`, then finalize `staged`.
    ///
    /// A transfer failure leaves the staged snapshot writable for a later
    /// retry. A finalize failure is reported separately: the data is in place
    /// but the snapshot is not read-only.
    pub async fn sync(
        &self,
        label: &SnapshotLabel,
        desired: PathBuf,
        staged: PathBuf,
        cancel: &CancellationToken,
    ) -> Result<TransferStats> {
        let started = Instant::now();
        let transfer = Arc::clone(&self.transfer);
        let token = cancel.clone();
        let staged_path = staged.clone();

        let outcome =
            tokio::task::spawn_blocking(move || transfer.sync(&desired, &staged_path, &token))
                .await
                .map_err(|e| MirrorError::Transfer {
                    label: label.to_string(),
                    source: TransferError::Io(std::io::Error::other(e)),
                })?;

        let mut stats = match outcome {
            Ok(stats) => stats,
            Err(TransferError::Cancelled) => return Err(MirrorError::Cancelled),
            Err(source) => {
                return Err(MirrorError::Transfer {
                    label: label.to_string(),
                    source,
                })
            }
        };
        stats.elapsed = started.elapsed();

        self.finalize(label, staged).await?;

        info!(
            label = %label,
            literal_bytes = stats.literal_bytes,
            "Transfer complete, snapshot finalized"
        );
        Ok(stats)
    }

    async fn finalize(&self, label: &SnapshotLabel, staged: PathBuf) -> Result<()> {
        let volume = Arc::clone(&self.volume);

        tokio::task::spawn_blocking(move || {
            volume.finalize_readonly(&staged)?;
            volume.sync(&staged)
        })
        .await
        .map_err(|e| MirrorError::Io(std::io::Error::other(e)))?
        .map_err(|source| MirrorError::Finalize {
            label: label.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::VolumeError;
    use std::sync::Mutex;

    struct FixedTransfer(fn() -> std::result::Result<TransferStats, TransferError>);

    impl DeltaTransfer for FixedTransfer {
        fn sync(
            &self,
            _desired: &Path,
            _staged: &Path,
            _cancel: &CancellationToken,
        ) -> std::result::Result<TransferStats, TransferError> {
            (self.0)()
        }
    }

    #[derive(Default)]
    struct RecordingVolume {
        finalized: Mutex<Vec<PathBuf>>,
        refuse_finalize: bool,
    }

    impl VolumeOps for RecordingVolume {
        fn list_snapshots(&self, _root: &Path) -> std::result::Result<Vec<String>, VolumeError> {
            Ok(Vec::new())
        }

        fn is_readonly(&self, _snapshot: &Path) -> std::result::Result<bool, VolumeError> {
            Ok(false)
        }

        fn create_writable_snapshot(
            &self,
            _base: &Path,
            _staged: &Path,
        ) -> std::result::Result<(), VolumeError> {
            Ok(())
        }

        fn finalize_readonly(&self, snapshot: &Path) -> std::result::Result<(), VolumeError> {
            if self.refuse_finalize {
                return Err(VolumeError::CommandFailed {
                    command: "property set".into(),
                    status: "exit status: 1".into(),
                    stderr: "read-only filesystem".into(),
                });
            }
            self.finalized.lock().unwrap().push(snapshot.to_path_buf());
            Ok(())
        }

        fn sync(&self, _path: &Path) -> std::result::Result<(), VolumeError> {
            Ok(())
        }
    }

    fn invoker(transfer: FixedTransfer, volume: Arc<RecordingVolume>) -> TransferInvoker {
        TransferInvoker::new(Arc::new(transfer), volume)
    }

    #[tokio::test]
    async fn test_success_finalizes() {
        let volume = Arc::new(RecordingVolume::default());
        let invoker = invoker(
            FixedTransfer(|| {
                Ok(TransferStats {
                    literal_bytes: Some(20),
                    ..Default::default()
                })
            }),
            Arc::clone(&volume),
        );

        let stats = invoker
            .sync(
                &SnapshotLabel::from("2020-01-02"),
                "/src/2020-01-02".into(),
                "/dst/2020-01-02".into(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.literal_bytes, Some(20));
        assert_eq!(
            *volume.finalized.lock().unwrap(),
            vec![PathBuf::from("/dst/2020-01-02")]
        );
    }

    #[tokio::test]
    async fn test_transfer_failure_leaves_snapshot_staged() {
        let volume = Arc::new(RecordingVolume::default());
        let invoker = invoker(
            FixedTransfer(|| {
                Err(TransferError::Failed {
                    program: "rsync".into(),
                    status: "exit status: 23".into(),
                })
            }),
            Arc::clone(&volume),
        );

        let err = invoker
            .sync(
                &SnapshotLabel::from("2020-01-02"),
                "/src/2020-01-02".into(),
                "/dst/2020-01-02".into(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MirrorError::Transfer { .. }));
        assert!(volume.finalized.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_transfer_is_not_a_failure() {
        let volume = Arc::new(RecordingVolume::default());
        let invoker = invoker(
            FixedTransfer(|| Err(TransferError::Cancelled)),
            Arc::clone(&volume),
        );

        let err = invoker
            .sync(
                &SnapshotLabel::from("2020-01-02"),
                "/src/2020-01-02".into(),
                "/dst/2020-01-02".into(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MirrorError::Cancelled));
        assert!(volume.finalized.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_failure_is_distinct() {
        let volume = Arc::new(RecordingVolume {
            refuse_finalize: true,
            ..Default::default()
        });
        let invoker = invoker(FixedTransfer(|| Ok(TransferStats::default())), volume);

        let err = invoker
            .sync(
                &SnapshotLabel::from("2020-01-02"),
                "/src/2020-01-02".into(),
                "/dst/2020-01-02".into(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MirrorError::Finalize { ref label, .. } if label == "2020-01-02"));
    }
}

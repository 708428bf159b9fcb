//! rsync as the delta-transfer mechanism.

use super::{DeltaTransfer, TransferStats};
use crate::config::TransferConfig;
use crate::utils::TransferError;
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// In place, delta always, deletions after the transfer, rename detection.
const RSYNC_FLAGS: &[&str] = &[
    "-a",
    "--delete-delay",
    "--inplace",
    "--preallocate",
    "--no-whole-file",
    "--fuzzy",
    "--stats",
];

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    program: String,
    extra_args: Vec<String>,
}

impl RsyncTransfer {
    pub fn new(program: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            extra_args,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.rsync.clone(), config.extra_args.clone())
    }

    fn command_args(&self, desired: &Path, staged: &Path) -> Vec<OsString> {
        let mut source = desired.as_os_str().to_os_string();
        if source.as_encoded_bytes().last() != Some(&b'/') {
            source.push("/");
        }

        RSYNC_FLAGS
            .iter()
            .map(OsString::from)
            .chain(self.extra_args.iter().map(OsString::from))
            .chain([source, staged.as_os_str().to_os_string()])
            .collect()
    }
}

impl DeltaTransfer for RsyncTransfer {
    fn sync(
        &self,
        desired: &Path,
        staged: &Path,
        cancel: &CancellationToken,
    ) -> Result<TransferStats, TransferError> {
        let args = self.command_args(desired, staged);
        debug!("Running {} {:?}", self.program, args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| TransferError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not captured"))?;
        let reader = thread::spawn(move || {
            let mut out = String::new();
            stdout.read_to_string(&mut out).map(|_| out)
        });

        let status = loop {
            if cancel.is_cancelled() {
                if let Err(e) = child.kill() {
                    warn!("Failed to stop {}: {}", self.program, e);
                }
                child.wait()?;
                match reader.join() {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => debug!("Discarding {} output after cancel: {}", self.program, e),
                    Err(_) => debug!("{} stdout reader panicked after cancel", self.program),
                }
                return Err(TransferError::Cancelled);
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let output = reader
            .join()
            .map_err(|_| io::Error::other("stdout reader panicked"))??;

        if !status.success() {
            return Err(TransferError::Failed {
                program: self.program.clone(),
                status: status.to_string(),
            });
        }

        Ok(TransferStats {
            literal_bytes: parse_literal_bytes(&output),
            matched_bytes: parse_stat(&output, "Matched data:"),
            elapsed: Duration::ZERO,
        })
    }
}

/// Changed-byte count from rsync `--stats` output.
pub fn parse_literal_bytes(output: &str) -> Option<u64> {
    parse_stat(output, "Literal data:")
}

fn parse_stat(output: &str, key: &str) -> Option<u64> {
    let rest = output
        .lines()
        .find_map(|line| line.trim().strip_prefix(key))?;
    let number: String = rest
        .split_whitespace()
        .next()?
        .chars()
        .filter(|c| *c != ',')
        .collect();
    number.parse().ok()
}

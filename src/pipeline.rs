//! Copy / verify pipeline.
//!
//! One `(entry, destination)` run through `RECONCILE → (SKIP | COPY |
//! QUARANTINE_THEN_COPY) → FLUSH → VERIFY → DONE`, with every state
//! transition and blocking-syscall boundary checked against cancellation.
//! No resume support and no bandwidth throttling: each file either
//! completes its state machine or is reported failed.

use crate::digest;
use crate::error::PipelineError;
use crate::events::{Action, ActionRecord};
use crate::manifest::FileManifestEntry;
use crate::quarantine;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MAX_TRANSIENT_RETRIES: u32 = 3;
const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Outcome of running the pipeline for one file against one destination.
pub struct PipelineRun {
    /// One or more action records, in the order they occurred (e.g. a
    /// `QUARANTINED` record followed by `COPIED`/`VERIFIED`, or `FAILED`).
    pub records: Vec<ActionRecord>,
    pub bytes_written: u64,
    pub terminal: Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Skipped,
    Verified,
    Failed,
}

/// Runs one file through the full state machine.
pub async fn run(
    entry: &FileManifestEntry,
    destination_root: &Path,
    session_id: Uuid,
    cancel: &CancellationToken,
) -> PipelineRun {
    let target = destination_root.join(relative_path_to_os(&entry.relative_path));
    let mut records = Vec::new();

    if cancel.is_cancelled() {
        records.push(failed_record(session_id, entry, &target, PipelineError::Cancelled));
        return PipelineRun {
            records,
            bytes_written: 0,
            terminal: Terminal::Failed,
        };
    }

    if let Err(e) = ensure_parent_dir(&target).await {
        records.push(failed_record(
            session_id,
            entry,
            &target,
            PipelineError::copy_io(e),
        ));
        return PipelineRun {
            records,
            bytes_written: 0,
            terminal: Terminal::Failed,
        };
    }

    match reconcile(entry, &target, cancel).await {
        Ok(Reconciliation::Skip) => {
            records.push(ActionRecord::new(
                session_id,
                Action::Skipped,
                entry.source_absolute_path.display().to_string(),
                target.display().to_string(),
                entry.digest.clone(),
                entry.size_bytes,
                "Already exists with matching checksum",
            ));
            return PipelineRun {
                records,
                bytes_written: 0,
                terminal: Terminal::Skipped,
            };
        }
        Ok(Reconciliation::Copy) => {}
        Ok(Reconciliation::QuarantineThenCopy) => {
            match quarantine::quarantine_file(destination_root, &target) {
                Ok(quarantine_path) => {
                    let displaced_digest =
                        digest::digest_file(&quarantine_path, cancel).unwrap_or_default();
                    records.push(ActionRecord::new(
                        session_id,
                        Action::Quarantined,
                        entry.source_absolute_path.display().to_string(),
                        quarantine_path.display().to_string(),
                        displaced_digest,
                        entry.size_bytes,
                        "Digest mismatch with incoming file",
                    ));
                }
                Err(e) => {
                    records.push(failed_record(
                        session_id,
                        entry,
                        &target,
                        PipelineError::QuarantineFailed(e.to_string()),
                    ));
                    return PipelineRun {
                        records,
                        bytes_written: 0,
                        terminal: Terminal::Failed,
                    };
                }
            }
        }
        Err(e) => {
            records.push(failed_record(session_id, entry, &target, e));
            return PipelineRun {
                records,
                bytes_written: 0,
                terminal: Terminal::Failed,
            };
        }
    }

    if cancel.is_cancelled() {
        records.push(failed_record(session_id, entry, &target, PipelineError::Cancelled));
        return PipelineRun {
            records,
            bytes_written: 0,
            terminal: Terminal::Failed,
        };
    }

    if let Err(e) = copy_with_retry(&entry.source_absolute_path, &target, cancel).await {
        records.push(failed_record(session_id, entry, &target, e));
        return PipelineRun {
            records,
            bytes_written: 0,
            terminal: Terminal::Failed,
        };
    }

    if cancel.is_cancelled() {
        records.push(failed_record(session_id, entry, &target, PipelineError::Cancelled));
        return PipelineRun {
            records,
            bytes_written: entry.size_bytes,
            terminal: Terminal::Failed,
        };
    }

    if let Err(e) = flush_with_retry(&target, cancel).await {
        records.push(failed_record(session_id, entry, &target, e));
        return PipelineRun {
            records,
            bytes_written: entry.size_bytes,
            terminal: Terminal::Failed,
        };
    }

    if cancel.is_cancelled() {
        records.push(failed_record(session_id, entry, &target, PipelineError::Cancelled));
        return PipelineRun {
            records,
            bytes_written: entry.size_bytes,
            terminal: Terminal::Failed,
        };
    }

    match verify(entry, &target, cancel).await {
        Ok(()) => {
            records.push(ActionRecord::new(
                session_id,
                Action::Copied,
                entry.source_absolute_path.display().to_string(),
                target.display().to_string(),
                entry.digest.clone(),
                entry.size_bytes,
                "",
            ));
            records.push(ActionRecord::new(
                session_id,
                Action::Verified,
                entry.source_absolute_path.display().to_string(),
                target.display().to_string(),
                entry.digest.clone(),
                entry.size_bytes,
                "",
            ));
            PipelineRun {
                records,
                bytes_written: entry.size_bytes,
                terminal: Terminal::Verified,
            }
        }
        Err(e) => {
            records.push(failed_record(session_id, entry, &target, e));
            PipelineRun {
                records,
                bytes_written: entry.size_bytes,
                terminal: Terminal::Failed,
            }
        }
    }
}

enum Reconciliation {
    Skip,
    Copy,
    QuarantineThenCopy,
}

async fn reconcile(
    entry: &FileManifestEntry,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<Reconciliation, PipelineError> {
    let metadata = match tokio::fs::metadata(target).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Reconciliation::Copy),
        Err(e) => return Err(PipelineError::copy_io(e)),
    };

    if metadata.len() != entry.size_bytes {
        tokio::fs::remove_file(target)
            .await
            .map_err(PipelineError::copy_io)?;
        return Ok(Reconciliation::Copy);
    }

    let target = target.to_path_buf();
    let cancel = cancel.clone();
    let target_digest = tokio::task::spawn_blocking(move || digest::digest_file(&target, &cancel))
        .await
        .expect("digest task panicked")
        .map_err(|e| PipelineError::SourceUnreadable(e))?;

    if target_digest == entry.digest {
        Ok(Reconciliation::Skip)
    } else {
        Ok(Reconciliation::QuarantineThenCopy)
    }
}

async fn ensure_parent_dir(target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn copy_with_retry(
    source: &Path,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    with_transient_retry(cancel, || {
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        async move {
            tokio::fs::copy(&source, &target)
                .await
                .map(|_| ())
                .map_err(PipelineError::copy_io)
        }
    })
    .await
}

async fn flush_with_retry(target: &Path, cancel: &CancellationToken) -> Result<(), PipelineError> {
    with_transient_retry(cancel, || {
        let target = target.to_path_buf();
        async move {
            let file = tokio::fs::File::open(&target)
                .await
                .map_err(PipelineError::flush_error)?;
            file.sync_all().await.map_err(PipelineError::flush_error)
        }
    })
    .await
}

async fn verify(
    entry: &FileManifestEntry,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let target_owned = target.to_path_buf();
    let cancel_clone = cancel.clone();
    let actual = tokio::task::spawn_blocking(move || digest::digest_file(&target_owned, &cancel_clone))
        .await
        .expect("digest task panicked")
        .map_err(|_| PipelineError::VerifyMismatch)?;

    if actual == entry.digest {
        Ok(())
    } else {
        Err(PipelineError::VerifyMismatch)
    }
}

/// Retries a fallible async operation up to [`MAX_TRANSIENT_RETRIES`] times
/// with the fixed 1s/2s/4s backoff schedule, but only when the error
/// classifies as transient. Checksum mismatch and cancellation are never
/// retried.
async fn with_transient_retry<F, Fut>(
    cancel: &CancellationToken,
    mut op: F,
) -> Result<(), PipelineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), PipelineError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if e.classify() == crate::error::FailureClass::Transient && attempt < MAX_TRANSIENT_RETRIES => {
                tokio::select! {
                    _ = tokio::time::sleep(BACKOFF_SCHEDULE[attempt as usize]) => {}
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn relative_path_to_os(relative_path: &str) -> PathBuf {
    relative_path.split('/').collect()
}

fn failed_record(
    session_id: Uuid,
    entry: &FileManifestEntry,
    target: &Path,
    error: PipelineError,
) -> ActionRecord {
    ActionRecord::new(
        session_id,
        Action::Failed,
        entry.source_absolute_path.display().to_string(),
        target.display().to_string(),
        String::new(),
        entry.size_bytes,
        error.reason(),
    )
}

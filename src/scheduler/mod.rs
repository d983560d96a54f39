//! Destination scheduler.
//!
//! One task per destination, owning a [`Semaphore`] sized to its medium's
//! lane width, so each destination's concurrency is governed independently
//! rather than sharing one global budget across every mount.

pub mod medium;
pub mod state;

use crate::collaborators::{DestinationProbe, EventSink, LogLevel};
use crate::events::{Action, ActionLog, ActionRecord, ManifestSink};
use crate::manifest::Manifest;
use crate::pipeline;
use state::{DestinationPhase, DestinationState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long a destination may register zero forward progress before the
/// stall watchdog trips it, while at least one peer destination is still
/// progressing.
const STALL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SchedulerOutcome {
    pub mount_path: PathBuf,
    pub final_state: DestinationState,
    /// Every `FAILED` action record produced on this destination, surfaced
    /// to the orchestrator so it can report `(file, destination, reason)`
    /// tuples without re-reading the on-disk action log.
    pub failures: Vec<ActionRecord>,
}

/// Runs one destination's schedule to completion (or cancellation/stall).
///
/// `state` is created by the caller (the orchestrator) before this task is
/// spawned, so the orchestrator's progress aggregator can read live
/// snapshots through its own clone of the same handle while this function
/// drives it.
///
/// `peer_is_progressing` is polled by the stall watchdog to decide whether
/// *this* destination's lack of progress is a real stall (peers moving) or
/// simply a quiet run (nothing is moving anywhere, e.g. near the very end).
pub async fn run_destination(
    manifest: Arc<Manifest>,
    mount_path: PathBuf,
    probe: DestinationProbe,
    network_present: bool,
    session_id: Uuid,
    state: Arc<Mutex<DestinationState>>,
    cancel: CancellationToken,
    event_sink: Arc<dyn EventSink>,
    peer_is_progressing: Arc<dyn Fn() -> bool + Send + Sync>,
) -> SchedulerOutcome {
    let lane_width = medium::lane_width(probe.medium_class, network_present);
    let semaphore = Arc::new(Semaphore::new(lane_width));

    state.lock().await.phase = DestinationPhase::Copying;

    let action_log = match ActionLog::open(&mount_path) {
        Ok(log) => Some(Arc::new(log)),
        Err(e) => {
            event_sink.log(
                LogLevel::Error,
                "events",
                &format!("failed to open action log for {}: {e}", mount_path.display()),
            );
            None
        }
    };

    let all_records = Arc::new(Mutex::new(Vec::<ActionRecord>::new()));
    let destination_cancel = cancel.child_token();

    let watchdog = tokio::spawn(stall_watchdog(
        state.clone(),
        destination_cancel.clone(),
        peer_is_progressing,
    ));

    let mut handles = Vec::with_capacity(manifest.len());
    for entry in manifest.entries() {
        let entry = entry.clone();
        let semaphore = semaphore.clone();
        let mount_path = mount_path.clone();
        let cancel = destination_cancel.clone();
        let state = state.clone();
        let action_log = action_log.clone();
        let all_records = all_records.clone();
        let event_sink = event_sink.clone();

        handles.push(tokio::spawn(async move {
            let permit = tokio::select! {
                permit = semaphore.acquire() => Some(permit.expect("semaphore closed")),
                _ = cancel.cancelled() => None,
            };
            if permit.is_none() {
                // Never dispatched: still record a terminal outcome for
                // this file so the destination's counters stay consistent
                // and no failure is silently dropped.
                let record = ActionRecord::new(
                    session_id,
                    Action::Failed,
                    entry.source_absolute_path.display().to_string(),
                    mount_path.join(entry.relative_path.replace('/', std::path::MAIN_SEPARATOR_STR))
                        .display()
                        .to_string(),
                    String::new(),
                    entry.size_bytes,
                    "Cancelled",
                );
                state.lock().await.record_failed();
                if let Some(log) = &action_log {
                    let _ = log.append(&record);
                }
                all_records.lock().await.push(record);
                return;
            }

            let run_result = pipeline::run(&entry, &mount_path, session_id, &cancel).await;

            {
                let mut state = state.lock().await;
                for record in &run_result.records {
                    match record.action {
                        Action::Copied => state.record_copied(entry.size_bytes),
                        Action::Skipped => state.record_skipped(),
                        Action::Verified => state.record_verified(),
                        Action::Failed => state.record_failed(),
                        Action::Quarantined => state.record_quarantined(),
                    }
                    if let Some(log) = &action_log {
                        if let Err(e) = log.append(record) {
                            event_sink.log(LogLevel::Warning, "events", &format!("action log write failed: {e}"));
                        }
                    }
                }
            }

            all_records.lock().await.extend(run_result.records);
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    destination_cancel.cancel();
    let _ = watchdog.await;

    let mut final_state = {
        let mut state = state.lock().await;
        state.mark_complete_if_done();
        if cancel.is_cancelled() && !state.is_terminal() {
            state.mark_failed();
        }
        state.clone()
    };
    if !final_state.is_terminal() {
        final_state.mark_failed();
    }

    let records = all_records.lock().await;
    if let Err(e) = ManifestSink::write(&mount_path, session_id, &records) {
        event_sink.log(
            LogLevel::Warning,
            "events",
            &format!("manifest sink write failed for {}: {e}", mount_path.display()),
        );
    }

    let failures = records
        .iter()
        .filter(|r| matches!(r.action, Action::Failed))
        .cloned()
        .collect();

    SchedulerOutcome {
        mount_path,
        final_state,
        failures,
    }
}

/// Trips the destination to `failed` with `NetworkTimeout` if it registers
/// zero forward progress for [`STALL_TIMEOUT`] while a peer destination is
/// still progressing.
async fn stall_watchdog(
    state: Arc<Mutex<DestinationState>>,
    cancel: CancellationToken,
    peer_is_progressing: Arc<dyn Fn() -> bool + Send + Sync>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let mut state = state.lock().await;
        if state.is_terminal() {
            return;
        }
        if state.time_since_progress() >= STALL_TIMEOUT && peer_is_progressing() {
            state.mark_failed_with_reason("NetworkTimeout");
            cancel.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MediumClass;
    use std::path::PathBuf;

    /// S6 Network stall: a destination that registers zero forward progress
    /// for 60s while a peer is still progressing is tripped to `failed` with
    /// reason `NetworkTimeout`, and its cancellation token is cancelled so
    /// the scheduler's remaining per-file tasks exit.
    #[tokio::test(start_paused = true)]
    async fn stalled_destination_is_failed_with_network_timeout_when_peer_progresses() {
        let state = Arc::new(Mutex::new(DestinationState::new(
            PathBuf::from("/net"),
            MediumClass::Network,
            10,
            1000,
        )));
        let cancel = CancellationToken::new();
        let peer_is_progressing: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(|| true);

        let watchdog = tokio::spawn(stall_watchdog(state.clone(), cancel.clone(), peer_is_progressing));
        tokio::time::advance(STALL_TIMEOUT + Duration::from_secs(1)).await;
        watchdog.await.unwrap();

        let state = state.lock().await;
        assert_eq!(state.phase, DestinationPhase::Failed);
        assert_eq!(state.failure_reason.as_deref(), Some("NetworkTimeout"));
        assert!(cancel.is_cancelled());
    }

    /// A quiet run — no peer destination is progressing either — is not a
    /// stall: the watchdog must not trip the destination just because it is
    /// personally idle near the end of a run.
    #[tokio::test(start_paused = true)]
    async fn no_trip_when_no_peer_is_progressing() {
        let state = Arc::new(Mutex::new(DestinationState::new(
            PathBuf::from("/net"),
            MediumClass::Network,
            10,
            1000,
        )));
        let cancel = CancellationToken::new();
        let peer_is_progressing: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(|| false);

        let watchdog = tokio::spawn(stall_watchdog(state.clone(), cancel.clone(), peer_is_progressing));
        tokio::time::advance(STALL_TIMEOUT + Duration::from_secs(1)).await;
        cancel.cancel();
        watchdog.await.unwrap();

        let state = state.lock().await;
        assert_ne!(state.phase, DestinationPhase::Failed);
    }

    /// Forward progress before the timeout resets the clock; the watchdog
    /// must not trip a destination that is merely slow.
    #[tokio::test(start_paused = true)]
    async fn progress_before_timeout_prevents_trip() {
        let state = Arc::new(Mutex::new(DestinationState::new(
            PathBuf::from("/net"),
            MediumClass::Network,
            10,
            1000,
        )));
        let cancel = CancellationToken::new();
        let peer_is_progressing: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(|| true);

        let watchdog = tokio::spawn(stall_watchdog(state.clone(), cancel.clone(), peer_is_progressing));
        tokio::time::advance(STALL_TIMEOUT - Duration::from_secs(5)).await;
        state.lock().await.record_copied(10);
        tokio::time::advance(Duration::from_secs(10)).await;
        cancel.cancel();
        watchdog.await.unwrap();

        let state = state.lock().await;
        assert_ne!(state.phase, DestinationPhase::Failed);
    }
}

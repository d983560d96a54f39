//! Orchestrator.
//!
//! Drives the phase sequence, owns the level-triggered cancellation token,
//! collects per-destination failures, and seals the session exactly once.
//! One destination scheduler per destination runs concurrently under this
//! token, and the orchestrator walks `analyzing_source → building_manifest →
//! copying_files → flushing_to_disk → verifying_destinations → complete`
//! before sealing the session.

use crate::collaborators::{EventSink, FileClassifier, LogLevel, MediumClass};
use crate::config::EngineConfig;
use crate::digest;
use crate::error::EngineError;
use crate::events::ActionRecord;
use crate::manifest::{self, Manifest};
use crate::progress::{OverallProgress, ProgressAggregator};
use crate::scheduler::{self, state::DestinationState};
use crate::session::{Session, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Phases advance monotonically; `Complete` is also reachable directly from
/// any intermediate phase on cancellation, with the session status then
/// `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AnalyzingSource,
    BuildingManifest,
    CopyingFiles,
    FlushingToDisk,
    VerifyingDestinations,
    Complete,
}

/// One destination to back up to, with its medium probe already applied by
/// the UI before the request reaches the orchestrator.
pub struct DestinationTarget {
    pub mount_path: PathBuf,
    pub medium_class: MediumClass,
    pub free_bytes: Option<u64>,
}

/// A fully-resolved request to run one backup session. The UI layer is
/// responsible for resolving paths, probing destinations, and deciding
/// `confirm_retag_source`; the orchestrator never prompts.
pub struct BackupRequest {
    pub source_root: PathBuf,
    pub destinations: Vec<DestinationTarget>,
    pub classifier: Arc<dyn FileClassifier>,
    pub config: EngineConfig,
    pub event_sink: Arc<dyn EventSink>,
    /// User has explicitly confirmed re-tagging a source directory that a
    /// destination's `.imageintact_source` marker claims was previously
    /// used as a source.
    pub confirm_retag_source: bool,
}

/// Final report returned once the session reaches a terminal state.
pub struct SessionReport {
    pub session: Session,
    pub manifest_len: usize,
    pub destinations: Vec<DestinationState>,
    /// Every `(file, destination, reason)` tuple the engine recorded as
    /// `FAILED`, across all destinations.
    pub failures: Vec<ActionRecord>,
}

/// Source-tag marker written under `<source>/.imageintact_source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMarker {
    pub source_id: Uuid,
    pub tagged_date: DateTime<Utc>,
    pub app_version: String,
}

const SOURCE_MARKER_NAME: &str = ".imageintact_source";

pub struct Orchestrator {
    cancel: CancellationToken,
    phase_tx: watch::Sender<Phase>,
}

impl Orchestrator {
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(Phase::AnalyzingSource);
        Self {
            cancel: CancellationToken::new(),
            phase_tx,
        }
    }

    /// A cloneable handle the UI can subscribe to for phase transitions.
    pub fn phase_receiver(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Propagates cancellation to the digest engine, manifest builder, and
    /// every destination scheduler. Level-triggered: a single
    /// shared token observed by all workers.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn set_phase(&self, phase: Phase) {
        let _ = self.phase_tx.send(phase);
    }

    /// Runs one end-to-end backup session for `request` to completion,
    /// cancellation, or a precondition failure.
    pub async fn run(&self, request: BackupRequest) -> Result<SessionReport, EngineError> {
        let mut session = Session::start();

        if let Err(e) = check_preconditions(&request) {
            request.event_sink.log(LogLevel::Error, "orchestrator", &e.to_string());
            return Err(e);
        }

        self.set_phase(Phase::AnalyzingSource);
        if let Err(e) = reconcile_source_tag(&request) {
            request.event_sink.log(LogLevel::Error, "orchestrator", &e.to_string());
            return Err(e);
        }

        self.set_phase(Phase::BuildingManifest);
        let manifest = match self.build_manifest(&request).await {
            Some(manifest) => manifest,
            None => {
                session.seal(SessionStatus::Cancelled);
                self.set_phase(Phase::Complete);
                return Ok(SessionReport {
                    session,
                    manifest_len: 0,
                    destinations: Vec::new(),
                    failures: Vec::new(),
                });
            }
        };

        check_free_space(&request, &manifest)?;

        let manifest = Arc::new(manifest);
        let network_present = request
            .destinations
            .iter()
            .any(|d| d.medium_class == MediumClass::Network);

        self.set_phase(Phase::CopyingFiles);
        let outcomes = self
            .run_destinations(&request, manifest.clone(), network_present, session.session_id)
            .await;

        self.set_phase(Phase::FlushingToDisk);
        // Each file's flush already completed inside the pipeline before it
        // was counted as verified; this phase is a visible checkpoint
        // between "copies issued" and the final verification tally, not an
        // additional blocking step.
        self.set_phase(Phase::VerifyingDestinations);

        let mut destinations = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            destinations.push(outcome.final_state);
            failures.extend(outcome.failures);
        }

        let status = if self.cancel.is_cancelled() {
            SessionStatus::Cancelled
        } else if all_verified(&destinations) {
            SessionStatus::Completed
        } else {
            SessionStatus::CompletedWithErrors
        };
        session.seal(status);
        self.set_phase(Phase::Complete);

        Ok(SessionReport {
            session,
            manifest_len: manifest.len(),
            destinations,
            failures,
        })
    }

    async fn build_manifest(&self, request: &BackupRequest) -> Option<Manifest> {
        let event_sink = request.event_sink.clone();
        let on_status = {
            let event_sink = event_sink.clone();
            move |msg: &str| event_sink.log(LogLevel::Info, "manifest", msg)
        };
        let on_error = {
            let event_sink = event_sink.clone();
            move |err: &manifest::ManifestError| {
                event_sink.log(
                    LogLevel::Warning,
                    "manifest",
                    &format!("{}: {}", err.relative_path, err.reason),
                )
            }
        };

        manifest::build_manifest(
            &request.source_root,
            request.classifier.clone(),
            request.config.file_type_filter.clone(),
            request.config.skip_hidden_files,
            request.config.exclude_cache_files,
            self.cancel.clone(),
            &on_status,
            &on_error,
        )
        .await
    }

    async fn run_destinations(
        &self,
        request: &BackupRequest,
        manifest: Arc<Manifest>,
        network_present: bool,
        session_id: Uuid,
    ) -> Vec<scheduler::SchedulerOutcome> {
        let states: Vec<Arc<Mutex<DestinationState>>> = request
            .destinations
            .iter()
            .map(|d| {
                Arc::new(Mutex::new(DestinationState::new(
                    d.mount_path.clone(),
                    d.medium_class,
                    manifest.len() as u64,
                    manifest.total_bytes(),
                )))
            })
            .collect();

        let progress_handle = self.spawn_progress_task(
            states.clone(),
            manifest.total_bytes(),
            request.event_sink.clone(),
        );

        let mut handles = Vec::with_capacity(request.destinations.len());
        for (destination, state) in request.destinations.iter().zip(states.iter()) {
            let manifest = manifest.clone();
            let mount_path = destination.mount_path.clone();
            let probe = crate::collaborators::DestinationProbe {
                medium_class: destination.medium_class,
                est_write_mbps: None,
                free_bytes: destination.free_bytes,
                display_name: mount_path.display().to_string(),
            };
            let cancel = self.cancel.clone();
            let event_sink = request.event_sink.clone();
            let state = state.clone();
            let peer_states = states.clone();
            let this_path = mount_path.clone();
            let peer_is_progressing: Arc<dyn Fn() -> bool + Send + Sync> =
                Arc::new(move || peers_progressing(&peer_states, &this_path));

            handles.push(tokio::spawn(async move {
                scheduler::run_destination(
                    manifest,
                    mount_path,
                    probe,
                    network_present,
                    session_id,
                    state,
                    cancel,
                    event_sink,
                    peer_is_progressing,
                )
                .await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(outcome) = handle.await {
                outcomes.push(outcome);
            }
        }

        progress_handle.abort();
        outcomes
    }

    /// Spawns the orchestrator-owned progress aggregator loop: merges
    /// snapshots at ~1 Hz, notifies the event sink at the 10 Hz-capped rate
    /// from `ProgressAggregator::should_notify`.
    fn spawn_progress_task(
        &self,
        states: Vec<Arc<Mutex<DestinationState>>>,
        total_source_bytes: u64,
        event_sink: Arc<dyn EventSink>,
    ) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut aggregator = ProgressAggregator::new();
            let mut interval = tokio::time::interval(Duration::from_millis(200));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let mut snapshots = Vec::with_capacity(states.len());
                for state in &states {
                    snapshots.push(state.lock().await.clone());
                }
                let progress: OverallProgress = aggregator.merge(&snapshots, total_source_bytes);
                if aggregator.should_notify() {
                    event_sink.log(
                        LogLevel::Info,
                        "progress",
                        &format!(
                            "{}/{} files, {:.1}% bytes, {}",
                            progress.files_processed,
                            progress.total_files,
                            progress.byte_progress * 100.0,
                            match progress.eta {
                                crate::progress::Eta::Calculating => "Calculating…".to_string(),
                                crate::progress::Eta::Remaining(d) => crate::progress::format_duration(d),
                            }
                        ),
                    );
                }
                if snapshots.iter().all(|s| s.is_terminal()) {
                    return;
                }
            }
        })
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

fn peers_progressing(states: &[Arc<Mutex<DestinationState>>], exclude: &Path) -> bool {
    states.iter().any(|s| {
        let Ok(guard) = s.try_lock() else {
            return true;
        };
        guard.mount_path != exclude && !guard.is_terminal() && guard.time_since_progress() < Duration::from_secs(60)
    })
}

fn all_verified(destinations: &[DestinationState]) -> bool {
    destinations.iter().all(|d| {
        d.counters.failed == 0 && d.counters.verified + d.counters.skipped == d.total_files
    })
}

fn check_preconditions(request: &BackupRequest) -> Result<(), EngineError> {
    if !request.source_root.is_dir() {
        return Err(EngineError::Precondition(format!(
            "source directory does not exist: {}",
            request.source_root.display()
        )));
    }
    if request.destinations.is_empty() {
        return Err(EngineError::Precondition("no destinations configured".into()));
    }

    let source_canonical = request.source_root.canonicalize().ok();
    for destination in &request.destinations {
        if !destination.mount_path.exists() {
            return Err(EngineError::Precondition(format!(
                "destination does not exist: {}",
                destination.mount_path.display()
            )));
        }
        let dest_canonical = destination.mount_path.canonicalize().ok();
        if source_canonical.is_some() && source_canonical == dest_canonical {
            return Err(EngineError::Precondition(format!(
                "destination is the same as the source: {}",
                destination.mount_path.display()
            )));
        }
        if destination.mount_path.starts_with(&request.source_root) {
            return Err(EngineError::Precondition(format!(
                "destination is nested inside the source: {}",
                destination.mount_path.display()
            )));
        }
    }
    Ok(())
}

/// Rough pre-flight space check: a destination whose probed free space is
/// known and smaller than the manifest's total size is a precondition
/// failure surfaced before `copying_files`.
fn check_free_space(request: &BackupRequest, manifest: &Manifest) -> Result<(), EngineError> {
    let required = manifest.total_bytes();
    for destination in &request.destinations {
        if let Some(free) = destination.free_bytes {
            if free < required {
                return Err(EngineError::Precondition(format!(
                    "insufficient free space on {}: need {} bytes, have {}",
                    destination.mount_path.display(),
                    required,
                    free
                )));
            }
        }
    }
    Ok(())
}

/// Writes `<source>/.imageintact_source` if absent. Refuses to proceed if
/// any destination already carries a source-tag marker, unless the caller
/// has set `confirm_retag_source`, in which case that destination's marker
/// is removed.
fn reconcile_source_tag(request: &BackupRequest) -> Result<(), EngineError> {
    let marker_path = request.source_root.join(SOURCE_MARKER_NAME);
    if !marker_path.exists() {
        let marker = SourceMarker {
            source_id: Uuid::new_v4(),
            tagged_date: Utc::now(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let json = serde_json::to_string_pretty(&marker).map_err(EngineError::Serialization)?;
        std::fs::write(&marker_path, json).map_err(EngineError::Io)?;
    }

    for destination in &request.destinations {
        let dest_marker_path = destination.mount_path.join(SOURCE_MARKER_NAME);
        if dest_marker_path.exists() {
            if !request.confirm_retag_source {
                return Err(EngineError::Precondition(format!(
                    "{} was previously tagged as a source; confirm before using it as a destination",
                    destination.mount_path.display()
                )));
            }
            let _ = std::fs::remove_file(&dest_marker_path);
        }
    }
    Ok(())
}

/// Computes the 64-char digest of a single file outside the pipeline, used
/// by the CLI's pre-flight summary (`show_preflight_summary`) to spot-check
/// a source file before committing to a full run.
pub fn spot_check_digest(path: &Path, cancel: &CancellationToken) -> Result<String, EngineError> {
    digest::digest_file(path, cancel).map_err(|e| EngineError::Session(e.to_string()))
}

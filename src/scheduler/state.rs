//! Per-destination state.
//!
//! Each destination scheduler exclusively owns one `DestinationState` —
//! counters are mutated only by that destination's own task, and read as
//! immutable snapshots by the progress aggregator.

use crate::collaborators::MediumClass;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationPhase {
    Pending,
    Copying,
    Verifying,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounters {
    pub queued: u64,
    pub copied: u64,
    pub skipped: u64,
    pub verified: u64,
    pub failed: u64,
    pub quarantined: u64,
}

impl ProgressCounters {
    /// `copied + skipped + failed == total` at terminal state (invariant 5).
    pub fn accounted_for(&self) -> u64 {
        self.copied + self.skipped + self.failed
    }

    /// `verified ≤ copied` always: a `SKIPPED` file is never re-verified.
    pub fn verify_within_bounds(&self) -> bool {
        self.verified <= self.copied
    }
}

#[derive(Debug, Clone)]
pub struct DestinationState {
    pub mount_path: PathBuf,
    pub medium_class: MediumClass,
    pub counters: ProgressCounters,
    pub phase: DestinationPhase,
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub total_files: u64,
    /// Set by the stall watchdog when it trips this destination; `None`
    /// otherwise, including when the destination simply finishes with
    /// per-file failures rather than a destination-wide condition.
    pub failure_reason: Option<String>,
    started_at: Instant,
    last_progress_at: Instant,
    last_progress_counters: (u64, u64),
}

impl DestinationState {
    pub fn new(mount_path: PathBuf, medium_class: MediumClass, total_files: u64, total_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            mount_path,
            medium_class,
            counters: ProgressCounters {
                queued: total_files,
                ..Default::default()
            },
            phase: DestinationPhase::Pending,
            bytes_written: 0,
            total_bytes,
            total_files,
            failure_reason: None,
            started_at: now,
            last_progress_at: now,
            last_progress_counters: (0, 0),
        }
    }

    pub fn wall_clock_elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn observed_throughput_bytes_per_sec(&self) -> f64 {
        let secs = self.wall_clock_elapsed().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.bytes_written as f64 / secs
        }
    }

    pub fn record_copied(&mut self, bytes: u64) {
        self.counters.copied += 1;
        self.bytes_written += bytes;
        self.touch_progress();
    }

    pub fn record_skipped(&mut self) {
        self.counters.skipped += 1;
        self.touch_progress();
    }

    pub fn record_verified(&mut self) {
        self.counters.verified += 1;
    }

    pub fn record_failed(&mut self) {
        self.counters.failed += 1;
        self.touch_progress();
    }

    pub fn record_quarantined(&mut self) {
        self.counters.quarantined += 1;
    }

    fn touch_progress(&mut self) {
        let current = (self.counters.copied, self.counters.verified);
        if current != self.last_progress_counters {
            self.last_progress_counters = current;
            self.last_progress_at = Instant::now();
        }
    }

    /// Time since this destination last registered forward progress
    /// (copied + verified changed), used by the stall watchdog.
    pub fn time_since_progress(&self) -> Duration {
        self.last_progress_at.elapsed()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, DestinationPhase::Complete | DestinationPhase::Failed)
    }

    /// Terminal `complete` requires `verified + skipped + failed == total`
    /// (invariant 5): a `SKIPPED` file is never re-verified, so it must
    /// still count toward completion or an all-skipped resume never
    /// terminates.
    pub fn mark_complete_if_done(&mut self) {
        if self.counters.verified + self.counters.skipped + self.counters.failed == self.total_files {
            self.phase = DestinationPhase::Complete;
        }
    }

    pub fn mark_failed(&mut self) {
        self.phase = DestinationPhase::Failed;
    }

    pub fn mark_failed_with_reason(&mut self, reason: impl Into<String>) {
        self.phase = DestinationPhase::Failed;
        self.failure_reason = Some(reason.into());
    }
}

//! Progress aggregator.
//!
//! Merges per-destination progress into one coalesced snapshot on an
//! interval-driven `tokio::spawn`'d loop, rate-limited to 10 Hz. Owned
//! exclusively by the orchestrator thread; destination schedulers never
//! touch it directly — they publish their own counters, and the
//! orchestrator reads immutable snapshots per tick.

use crate::scheduler::state::DestinationState;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MAX_SAMPLES: usize = 10;
const MIN_SAMPLES_FOR_ETA: usize = 5;
const WARMUP: Duration = Duration::from_secs(2);
const ETA_CAP: Duration = Duration::from_secs(24 * 60 * 60);
const NOTIFY_INTERVAL: Duration = Duration::from_millis(100); // 10 Hz

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eta {
    Calculating,
    Remaining(Duration),
}

#[derive(Debug, Clone)]
pub struct OverallProgress {
    /// Σ bytes_written across destinations ÷ (total_source_bytes ×
    /// destination_count), in `[0.0, 1.0]`.
    pub byte_progress: f64,
    pub eta: Eta,
    pub files_processed: u64,
    pub total_files: u64,
    pub mean_throughput_mbps: f64,
}

pub struct ProgressAggregator {
    started_at: Instant,
    last_sample_at: Instant,
    last_bytes_written: u64,
    samples_mbps: VecDeque<f64>,
    last_notified_at: Option<Instant>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            last_sample_at: now,
            last_bytes_written: 0,
            samples_mbps: VecDeque::with_capacity(MAX_SAMPLES),
            last_notified_at: None,
        }
    }

    /// Merges the given per-destination snapshots into one overall view and
    /// records a throughput sample for the rolling ETA mean. Call roughly
    /// once per second; more frequent calls are cheap but only contribute a
    /// new sample once at least 1s has elapsed since the last one.
    pub fn merge(&mut self, destinations: &[DestinationState], total_source_bytes: u64) -> OverallProgress {
        let now = Instant::now();
        let total_bytes_written: u64 = destinations.iter().map(|d| d.bytes_written).sum();
        let total_files: u64 = destinations.iter().map(|d| d.total_files).sum();
        let files_processed: u64 = destinations
            .iter()
            .map(|d| d.counters.copied + d.counters.skipped + d.counters.failed)
            .sum();

        let elapsed_since_sample = now.duration_since(self.last_sample_at).as_secs_f64();
        if elapsed_since_sample >= 1.0 {
            let bytes_diff = total_bytes_written.saturating_sub(self.last_bytes_written);
            let mbps = (bytes_diff as f64 / elapsed_since_sample) / (1024.0 * 1024.0);
            if self.samples_mbps.len() == MAX_SAMPLES {
                self.samples_mbps.pop_front();
            }
            self.samples_mbps.push_back(mbps);
            self.last_sample_at = now;
            self.last_bytes_written = total_bytes_written;
        }

        let denominator = (total_source_bytes as f64) * (destinations.len().max(1) as f64);
        let byte_progress = if denominator > 0.0 {
            (total_bytes_written as f64 / denominator).min(1.0)
        } else {
            1.0
        };

        let mean_mbps = self.mean_throughput_mbps();
        let eta = self.eta(total_source_bytes, destinations, mean_mbps);

        OverallProgress {
            byte_progress,
            eta,
            files_processed,
            total_files,
            mean_throughput_mbps: mean_mbps,
        }
    }

    fn mean_throughput_mbps(&self) -> f64 {
        if self.samples_mbps.is_empty() {
            return 0.0;
        }
        self.samples_mbps.iter().sum::<f64>() / self.samples_mbps.len() as f64
    }

    fn eta(&self, total_source_bytes: u64, destinations: &[DestinationState], mean_mbps: f64) -> Eta {
        if self.started_at.elapsed() < WARMUP {
            return Eta::Calculating;
        }
        if self.samples_mbps.len() < MIN_SAMPLES_FOR_ETA || mean_mbps <= 0.0 {
            return Eta::Calculating;
        }

        let total_bytes_target = total_source_bytes * destinations.len().max(1) as u64;
        let bytes_written: u64 = destinations.iter().map(|d| d.bytes_written).sum();
        let remaining_bytes = total_bytes_target.saturating_sub(bytes_written);
        let remaining_secs = (remaining_bytes as f64) / (mean_mbps * 1024.0 * 1024.0);
        let remaining = Duration::from_secs_f64(remaining_secs.max(0.0));

        Eta::Remaining(remaining.min(ETA_CAP))
    }

    /// Rate-limits UI notifications to at most 10 Hz: returns
    /// `true` at most once per [`NOTIFY_INTERVAL`].
    pub fn should_notify(&mut self) -> bool {
        let now = Instant::now();
        match self.last_notified_at {
            Some(last) if now.duration_since(last) < NOTIFY_INTERVAL => false,
            _ => {
                self.last_notified_at = Some(now);
                true
            }
        }
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format a MB/s throughput figure as a human-readable string.
pub fn format_speed(mbps: f64) -> String {
    format!("{mbps:.2} MB/s")
}

/// Format a duration as a human-readable string.
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MediumClass;
    use std::path::PathBuf;

    fn dest(total_files: u64, total_bytes: u64, bytes_written: u64) -> DestinationState {
        let mut d = DestinationState::new(PathBuf::from("/d"), MediumClass::Internal, total_files, total_bytes);
        d.bytes_written = bytes_written;
        d
    }

    #[test]
    fn eta_is_calculating_before_warmup() {
        let mut agg = ProgressAggregator::new();
        let destinations = vec![dest(10, 1000, 100)];
        let progress = agg.merge(&destinations, 1000);
        assert_eq!(progress.eta, Eta::Calculating);
    }

    #[test]
    fn byte_progress_divides_by_destination_count() {
        let mut agg = ProgressAggregator::new();
        let destinations = vec![dest(10, 1000, 500), dest(10, 1000, 500)];
        let progress = agg.merge(&destinations, 1000);
        // 1000 bytes written total / (1000 source bytes * 2 destinations) = 0.5
        assert!((progress.byte_progress - 0.5).abs() < 1e-9);
    }

    #[test]
    fn byte_progress_caps_at_one() {
        let mut agg = ProgressAggregator::new();
        let destinations = vec![dest(1, 100, 100)];
        let progress = agg.merge(&destinations, 100);
        assert!(progress.byte_progress <= 1.0);
    }

    #[test]
    fn should_notify_rate_limits_to_10hz() {
        let mut agg = ProgressAggregator::new();
        assert!(agg.should_notify());
        assert!(!agg.should_notify());
    }

    #[test]
    fn format_bytes_scales_units() {
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn format_duration_scales_units() {
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m");
    }
}

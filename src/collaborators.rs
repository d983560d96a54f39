//! External collaborator contracts.
//!
//! The core never reaches for a platform API or a global directly; every
//! peripheral concern — classifying a file, probing a destination's medium,
//! reading preferences, and surfacing logs/events to a UI — is expressed as a
//! trait and handed to the orchestrator as an `Arc<dyn ...>`. Collaborator
//! handles (`CancellationToken` and friends) are passed explicitly into the
//! executor rather than reached for as process-wide globals.

use crate::config::EngineConfig;
use crate::events::ActionRecord;
use std::collections::HashSet;
use std::path::Path;

/// A path's backup-relevant category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Image,
    Raw,
    Video,
    Sidecar,
    Unsupported,
}

/// Classifies source files by extension and answers the type-filter question.
pub trait FileClassifier: Send + Sync {
    fn classify(&self, path: &Path) -> FileCategory;
    fn is_supported(&self, path: &Path) -> bool {
        self.classify(path) != FileCategory::Unsupported
    }
}

/// Extension-table classifier. No external dependency: the supported set is
/// the common photo/video/sidecar extensions, lowercased.
pub struct ExtensionClassifier;

impl FileClassifier for ExtensionClassifier {
    fn classify(&self, path: &Path) -> FileCategory {
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(e) => e.to_ascii_lowercase(),
            None => return FileCategory::Unsupported,
        };
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "heic" | "tif" | "tiff" | "webp" => FileCategory::Image,
            "nef" | "cr2" | "cr3" | "arw" | "raf" | "dng" | "orf" | "rw2" => FileCategory::Raw,
            "mov" | "mp4" | "m4v" | "avi" | "mts" | "braw" => FileCategory::Video,
            "xmp" | "thm" | "aae" => FileCategory::Sidecar,
            _ => FileCategory::Unsupported,
        }
    }
}

/// A destination mount's observed medium and write characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumClass {
    Internal,
    PortableSsd,
    ExternalHdd,
    RemovableCard,
    Network,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct DestinationProbe {
    pub medium_class: MediumClass,
    pub est_write_mbps: Option<f64>,
    pub free_bytes: Option<u64>,
    pub display_name: String,
}

/// Probes a mount point for its medium class and capacity.
pub trait DrivePane: Send + Sync {
    fn probe(&self, mount_path: &Path) -> DestinationProbe;
}

/// Best-effort probe with no platform-specific dependency: always reports
/// `unknown`, which the scheduler treats as its most conservative tier.
/// A real UI would substitute a platform-aware probe (statvfs, DiskArbitration,
/// WMI) implementing the same trait.
pub struct UnknownDrivePane;

impl DrivePane for UnknownDrivePane {
    fn probe(&self, mount_path: &Path) -> DestinationProbe {
        DestinationProbe {
            medium_class: MediumClass::Unknown,
            est_write_mbps: None,
            // Cannot measure free space without a platform-specific API;
            // `None` defers the free-space precondition check rather than
            // reporting a false zero (spec §6.4: returning unknown is
            // always permissible).
            free_bytes: None,
            display_name: mount_path.display().to_string(),
        }
    }
}

/// Static configuration snapshot read once at job start.
pub trait PreferenceStore: Send + Sync {
    fn engine_config(&self) -> EngineConfig;
}

/// A preference store seeded from a parsed `Config`.
pub struct StaticPreferenceStore {
    config: EngineConfig,
}

impl StaticPreferenceStore {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl PreferenceStore for StaticPreferenceStore {
    fn engine_config(&self) -> EngineConfig {
        self.config.clone()
    }
}

/// Severity for `Logger::log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Parses the `minimum_log_level` config value (§6.3); unrecognised
    /// strings fall back to `Info`, matching `Config`'s own default.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warning" | "warn" => LogLevel::Warning,
            "error" => LogLevel::Error,
            "critical" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }
}

/// Structured logger and event store, both infallible from the core's
/// perspective: failures writing auxiliary logs are swallowed and never
/// abort a backup.
pub trait EventSink: Send + Sync {
    fn log(&self, level: LogLevel, category: &str, msg: &str);
    fn append(&self, record: &ActionRecord);
}

/// Logs through `tracing`; drops the action record (a real UI/event-store
/// would persist it — the engine's own on-disk CSV sink in `src/events.rs`
/// already guarantees durability, so this default implementation need not
/// duplicate it).
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn log(&self, level: LogLevel, category: &str, msg: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(category, "{msg}"),
            LogLevel::Info => tracing::info!(category, "{msg}"),
            LogLevel::Warning => tracing::warn!(category, "{msg}"),
            LogLevel::Error | LogLevel::Critical => tracing::error!(category, "{msg}"),
        }
    }

    fn append(&self, _record: &ActionRecord) {}
}

/// Wraps another [`EventSink`] and drops `log` calls below a configured
/// minimum severity, implementing §6.3's `minimum_log_level` config surface.
/// `append` (durable action records) is never filtered — the per-session CSV
/// is a record of what happened, not a log stream, and has no severity.
pub struct FilteredEventSink {
    inner: std::sync::Arc<dyn EventSink>,
    minimum: LogLevel,
}

impl FilteredEventSink {
    pub fn new(inner: std::sync::Arc<dyn EventSink>, minimum: LogLevel) -> Self {
        Self { inner, minimum }
    }
}

impl EventSink for FilteredEventSink {
    fn log(&self, level: LogLevel, category: &str, msg: &str) {
        if level >= self.minimum {
            self.inner.log(level, category, msg);
        }
    }

    fn append(&self, record: &ActionRecord) {
        self.inner.append(record);
    }
}

/// Resolve the effective type filter: admitted iff the classifier supports
/// the file *and* the filter allows it.
pub fn type_filter_admits(
    classifier: &dyn FileClassifier,
    filter: &HashSet<String>,
    path: &Path,
) -> bool {
    if !classifier.is_supported(path) {
        return false;
    }
    if filter.is_empty() {
        return true;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => filter.contains(&ext.to_ascii_lowercase()),
        None => false,
    }
}

//! Event/manifest sink.
//!
//! Per destination, two append-only CSV files: a daily action log and a
//! per-session manifest written once the destination reaches a terminal
//! state. Any subscriber (the CLI's status printer, a future UI) receives
//! the same [`ActionRecord`] the CSV sink durably persists, via the `csv`
//! crate for the on-disk writers themselves.

use chrono::{DateTime, Local, Utc};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const LOGS_DIR_NAME: &str = ".imageintact_logs";
pub const CHECKSUMS_DIR_NAME: &str = ".imageintact_checksums";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Copied,
    Skipped,
    Quarantined,
    Verified,
    Failed,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Copied => "COPIED",
            Action::Skipped => "SKIPPED",
            Action::Quarantined => "QUARANTINED",
            Action::Verified => "VERIFIED",
            Action::Failed => "FAILED",
        }
    }
}

/// One per `(file, destination, outcome)` tuple, appended to the per-session
/// CSV. Commas in free-text fields are escaped by replacement with
/// `;` rather than quoting, matching the header contract in §4.6/§6.1.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub action: Action,
    pub source: String,
    pub destination: String,
    pub digest: String,
    pub algorithm: &'static str,
    pub file_size: u64,
    pub reason: String,
}

impl ActionRecord {
    pub fn new(
        session_id: Uuid,
        action: Action,
        source: impl Into<String>,
        destination: impl Into<String>,
        digest: impl Into<String>,
        file_size: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id,
            action,
            source: sanitize(source.into()),
            destination: sanitize(destination.into()),
            digest: digest.into(),
            algorithm: "SHA256",
            file_size,
            reason: sanitize(reason.into()),
        }
    }
}

fn sanitize(field: String) -> String {
    field.replace(',', ";")
}

/// Append-only per-destination CSV action log:
/// `<destination>/.imageintact_logs/imageintact_<YYYY-MM-DD>.csv`.
pub struct ActionLog {
    path: PathBuf,
}

impl ActionLog {
    pub fn open(destination_root: &Path) -> io::Result<Self> {
        let dir = destination_root.join(LOGS_DIR_NAME);
        std::fs::create_dir_all(&dir)?;
        let file_name = format!("imageintact_{}.csv", Local::now().format("%Y-%m-%d"));
        let path = dir.join(file_name);
        let needs_header = !path.exists();

        if needs_header {
            let mut writer = csv::Writer::from_writer(
                OpenOptions::new().create(true).append(true).open(&path)?,
            );
            writer.write_record([
                "timestamp",
                "session_id",
                "action",
                "source",
                "destination",
                "checksum",
                "algorithm",
                "file_size",
                "reason",
            ])?;
            writer.flush()?;
        }

        Ok(Self { path })
    }

    pub fn append(&self, record: &ActionRecord) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record([
            record.timestamp.to_rfc3339(),
            record.session_id.to_string(),
            record.action.as_str().to_string(),
            record.source.clone(),
            record.destination.clone(),
            record.digest.clone(),
            record.algorithm.to_string(),
            record.file_size.to_string(),
            record.reason.clone(),
        ])?;
        writer.flush()
    }
}

/// Final per-session manifest, written once the destination reaches a
/// terminal state: `<destination>/.imageintact_checksums/manifest_<YYYYMMDD_HHMMSS>_<session_id>.csv`.
/// One row per file (keyed by its path relative to the destination root),
/// carrying its most final outcome among `COPIED`, `SKIPPED`, and
/// `VERIFIED` — a copied file emits both a `COPIED` and a `VERIFIED`
/// record, but only the latter is listed.
pub struct ManifestSink;

impl ManifestSink {
    pub fn write(
        destination_root: &Path,
        session_id: Uuid,
        records: &[ActionRecord],
    ) -> io::Result<PathBuf> {
        let dir = destination_root.join(CHECKSUMS_DIR_NAME);
        std::fs::create_dir_all(&dir)?;

        let file_name = format!(
            "manifest_{}_{}.csv",
            Local::now().format("%Y%m%d_%H%M%S"),
            session_id
        );
        let path = dir.join(file_name);

        let mut by_relative_path: BTreeMap<String, &ActionRecord> = BTreeMap::new();
        for record in records {
            if !matches!(record.action, Action::Copied | Action::Skipped | Action::Verified) {
                continue;
            }
            let relative = relative_to_destination(destination_root, &record.destination);
            match by_relative_path.get(&relative) {
                Some(existing) if existing.action == Action::Verified => {}
                _ => {
                    by_relative_path.insert(relative, record);
                }
            }
        }

        let mut writer = csv::Writer::from_writer(std::fs::File::create(&path)?);
        writer.write_record([
            "file_path",
            "checksum",
            "algorithm",
            "file_size",
            "action",
            "timestamp",
        ])?;

        for (relative, record) in &by_relative_path {
            writer.write_record([
                relative.clone(),
                record.digest.clone(),
                record.algorithm.to_string(),
                record.file_size.to_string(),
                record.action.as_str().to_string(),
                record.timestamp.to_rfc3339(),
            ])?;
        }
        writer.flush()?;
        Ok(path)
    }
}

/// Strips `destination_root` from an absolute destination path and
/// normalizes the remainder to forward-slash form, matching the manifest
/// builder's own relative-path convention.
fn relative_to_destination(destination_root: &Path, absolute_destination: &str) -> String {
    let path = Path::new(absolute_destination);
    let relative = path.strip_prefix(destination_root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

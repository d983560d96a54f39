//! Manifest builder.
//!
//! Two phases: a fast depth-first enumeration that applies the exclusion
//! rules and type filter, then a bounded-parallel digesting batch over the
//! survivors, gated by a weighted semaphore the same way upload concurrency
//! is gated elsewhere in this codebase.

use crate::collaborators::{type_filter_admits, FileClassifier};
use crate::digest::{self, EMPTY_FILE_DIGEST};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// One source file accepted for backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileManifestEntry {
    /// Normalized, forward-slash, no leading separator, no `..`.
    pub relative_path: String,
    pub source_absolute_path: PathBuf,
    pub size_bytes: u64,
    /// Hex SHA-256, or [`EMPTY_FILE_DIGEST`] for zero-length files.
    pub digest: String,
}

/// A manifest is a set under `relative_path`; duplicates are a builder bug.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<FileManifestEntry>,
    by_relative_path: HashSet<String>,
}

impl Manifest {
    pub fn entries(&self) -> &[FileManifestEntry] {
        &self.entries
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, entry: FileManifestEntry) {
        debug_assert!(
            self.by_relative_path.insert(entry.relative_path.clone()),
            "duplicate relative_path in manifest: {}",
            entry.relative_path
        );
        self.entries.push(entry);
    }
}

/// One dropped-file report: reason string, destination is always `"manifest"`.
#[derive(Debug, Clone)]
pub struct ManifestError {
    pub relative_path: String,
    pub reason: String,
}

/// Progress callback signature: `"Scanning file N…"`, then
/// `"Calculating checksums for N files…"`.
pub type StatusCallback<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// File-error callback: one invocation per unreadable file, encountered
/// during either enumeration or digesting; the builder continues regardless.
pub type ErrorCallback<'a> = dyn Fn(&ManifestError) + Send + Sync + 'a;

const MAX_DIGEST_PARALLELISM: usize = 8;

/// Known cache-artifact exact names.
const CACHE_ARTIFACT_NAMES: &[&str] = &[
    ".DS_Store",
    "Thumbs.db",
    "Media Cache Files",
    "node_modules",
    ".git",
    "DerivedData",
];

/// Extensions that always fail the exclusion set regardless of the type filter.
const EXCLUDED_EXTENSIONS: &[&str] = &["tmp", "temp", "cache", "lock"];

fn has_excluded_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXCLUDED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn matches_cache_artifact(path: &Path) -> bool {
    path.components().any(|c| {
        let s = c.as_os_str().to_string_lossy();
        CACHE_ARTIFACT_NAMES.iter().any(|name| s == *name)
            || s.ends_with(".lrdata")
    })
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n != "." && n != "..")
        .unwrap_or(false)
}

/// Applies the exclusion set, given whether hidden files should be pruned (a
/// supported image extension rescues a hidden file) and whether the
/// cache-artifact set should be applied at all.
fn is_excluded(
    path: &Path,
    classifier: &dyn FileClassifier,
    skip_hidden_files: bool,
    exclude_cache_files: bool,
) -> bool {
    if exclude_cache_files {
        if matches_cache_artifact(path) || has_excluded_extension(path) {
            return true;
        }
    }
    if skip_hidden_files && is_hidden(path) && !classifier.is_supported(path) {
        return true;
    }
    false
}

/// Normalizes a path relative to `root` into the manifest's canonical
/// forward-slash, no-leading-separator form.
fn normalize_relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

struct Candidate {
    absolute_path: PathBuf,
    relative_path: String,
    size: u64,
}

/// Builds a [`Manifest`] for `root`, applying `filter` and the exclusion
/// rules, reporting progress via `on_status` and per-file failures via
/// `on_error`. Returns `None` only on cancellation; dropped files are
/// reported through `on_error`, not as a hard error.
pub async fn build_manifest(
    root: &Path,
    classifier: Arc<dyn FileClassifier>,
    filter: HashSet<String>,
    skip_hidden_files: bool,
    exclude_cache_files: bool,
    cancel: CancellationToken,
    on_status: &StatusCallback<'_>,
    on_error: &ErrorCallback<'_>,
) -> Option<Manifest> {
    let candidates = enumerate(
        root,
        classifier.as_ref(),
        &filter,
        skip_hidden_files,
        exclude_cache_files,
        &cancel,
        on_status,
        on_error,
    )?;

    digest_candidates(candidates, &cancel, on_status, on_error).await
}

fn enumerate(
    root: &Path,
    classifier: &dyn FileClassifier,
    filter: &HashSet<String>,
    skip_hidden_files: bool,
    exclude_cache_files: bool,
    cancel: &CancellationToken,
    on_status: &StatusCallback<'_>,
    on_error: &ErrorCallback<'_>,
) -> Option<Vec<Candidate>> {
    let mut candidates = Vec::new();
    let mut scanned = 0usize;

    let walker = walkdir::WalkDir::new(root).follow_links(false);
    for entry in walker {
        if cancel.is_cancelled() {
            return None;
        }
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                on_error(&ManifestError {
                    relative_path: e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() {
            // Symlinks to directories are skipped entirely; symlinks to
            // files fall through to the metadata resolution below.
            match std::fs::metadata(entry.path()) {
                Ok(m) if m.is_dir() => continue,
                Err(_) => continue,
                _ => {}
            }
        }

        let path = entry.path();
        if is_excluded(path, classifier, skip_hidden_files, exclude_cache_files) {
            continue;
        }
        if !type_filter_admits(classifier, filter, path) {
            continue;
        }

        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                on_error(&ManifestError {
                    relative_path: normalize_relative(root, path),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        scanned += 1;
        on_status(&format!("Scanning file {scanned}…"));

        candidates.push(Candidate {
            absolute_path: path.to_path_buf(),
            relative_path: normalize_relative(root, path),
            size: metadata.len(),
        });
    }

    Some(candidates)
}

async fn digest_candidates(
    candidates: Vec<Candidate>,
    cancel: &CancellationToken,
    on_status: &StatusCallback<'_>,
    on_error: &ErrorCallback<'_>,
) -> Option<Manifest> {
    let total = candidates.len();
    on_status(&format!("Calculating checksums for {total} files…"));

    let permits = MAX_DIGEST_PARALLELISM.min(total.max(1));
    let semaphore = Arc::new(Semaphore::new(permits));

    let mut handles = Vec::with_capacity(total);
    for candidate in candidates {
        if cancel.is_cancelled() {
            return None;
        }
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let path = candidate.absolute_path.clone();
            let digest_cancel = cancel.clone();
            let result = tokio::task::spawn_blocking(move || digest::digest_file(&path, &digest_cancel))
                .await
                .expect("digest task panicked");
            (candidate, result)
        }));
    }

    let mut manifest = Manifest::default();
    let mut by_path: HashMap<String, FileManifestEntry> = HashMap::new();

    for handle in handles {
        let (candidate, result) = handle.await.expect("digest task join failed");
        if cancel.is_cancelled() {
            return None;
        }
        match result {
            Ok(digest) => {
                by_path.insert(
                    candidate.relative_path.clone(),
                    FileManifestEntry {
                        relative_path: candidate.relative_path,
                        source_absolute_path: candidate.absolute_path,
                        size_bytes: candidate.size,
                        digest,
                    },
                );
            }
            Err(e) => {
                on_error(&ManifestError {
                    relative_path: candidate.relative_path,
                    reason: e.to_string(),
                });
            }
        }
    }

    // Stable order: by relative_path, so two consecutive builds over an
    // unchanged tree produce identical manifests regardless of the
    // non-deterministic completion order of the digesting tasks above.
    let mut paths: Vec<String> = by_path.keys().cloned().collect();
    paths.sort();
    for path in paths {
        manifest.push(by_path.remove(&path).expect("key just listed"));
    }

    Some(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ExtensionClassifier;
    use std::fs;
    use tempfile::TempDir;

    fn noop_status(_msg: &str) {}
    fn noop_error(_err: &ManifestError) {}

    #[tokio::test]
    async fn builds_manifest_excluding_cache_artifacts() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.jpg"), b"photo-bytes").unwrap();
        fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/x.jpg"), b"nested").unwrap();

        let classifier: Arc<dyn FileClassifier> = Arc::new(ExtensionClassifier);
        let manifest = build_manifest(
            dir.path(),
            classifier,
            HashSet::new(),
            true,
            true,
            CancellationToken::new(),
            &noop_status,
            &noop_error,
        )
        .await
        .unwrap();

        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.entries()[0].relative_path, "a.jpg");
    }

    #[tokio::test]
    async fn type_filter_restricts_admitted_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        fs::write(dir.path().join("c.nef"), b"raw-data").unwrap();

        let mut filter = HashSet::new();
        filter.insert("nef".to_string());

        let classifier: Arc<dyn FileClassifier> = Arc::new(ExtensionClassifier);
        let manifest = build_manifest(
            dir.path(),
            classifier,
            filter,
            true,
            true,
            CancellationToken::new(),
            &noop_status,
            &noop_error,
        )
        .await
        .unwrap();

        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.entries()[0].relative_path, "c.nef");
    }

    #[tokio::test]
    async fn empty_file_gets_sentinel_digest() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("empty.jpg"), b"").unwrap();

        let classifier: Arc<dyn FileClassifier> = Arc::new(ExtensionClassifier);
        let manifest = build_manifest(
            dir.path(),
            classifier,
            HashSet::new(),
            true,
            true,
            CancellationToken::new(),
            &noop_status,
            &noop_error,
        )
        .await
        .unwrap();

        assert_eq!(manifest.entries()[0].digest, EMPTY_FILE_DIGEST);
    }

    #[tokio::test]
    async fn two_builds_over_unchanged_tree_are_identical() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.jpg"), b"stable-content").unwrap();
        fs::write(dir.path().join("b.nef"), b"more-stable-content").unwrap();

        let classifier: Arc<dyn FileClassifier> = Arc::new(ExtensionClassifier);
        let first = build_manifest(
            dir.path(),
            classifier.clone(),
            HashSet::new(),
            true,
            true,
            CancellationToken::new(),
            &noop_status,
            &noop_error,
        )
        .await
        .unwrap();
        let second = build_manifest(
            dir.path(),
            classifier,
            HashSet::new(),
            true,
            true,
            CancellationToken::new(),
            &noop_status,
            &noop_error,
        )
        .await
        .unwrap();

        assert_eq!(first.entries(), second.entries());
    }

    #[tokio::test]
    async fn cancellation_before_digesting_yields_none() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let classifier: Arc<dyn FileClassifier> = Arc::new(ExtensionClassifier);
        let manifest = build_manifest(
            dir.path(),
            classifier,
            HashSet::new(),
            true,
            true,
            cancel,
            &noop_status,
            &noop_error,
        )
        .await;

        assert!(manifest.is_none());
    }
}

//! Integration tests for end-to-end backup scenarios (fresh copy, resume,
//! conflict quarantine, cancellation, type filtering).
//!
//! Builds real `tempfile::TempDir` source/destination trees and drives the
//! orchestrator end to end, asserting on the returned `SessionReport` and
//! the on-disk destination contents.

use imageintact_engine::collaborators::{ExtensionClassifier, MediumClass, TracingEventSink};
use imageintact_engine::config::EngineConfig;
use imageintact_engine::orchestrator::{BackupRequest, DestinationTarget, Orchestrator};
use imageintact_engine::session::SessionStatus;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn destination(path: &Path) -> DestinationTarget {
    DestinationTarget {
        mount_path: path.to_path_buf(),
        medium_class: MediumClass::Internal,
        free_bytes: None,
    }
}

fn request(source: &Path, destinations: Vec<PathBuf>, file_type_filter: HashSet<String>) -> BackupRequest {
    BackupRequest {
        source_root: source.to_path_buf(),
        destinations: destinations.into_iter().map(|d| destination(&d)).collect(),
        classifier: Arc::new(ExtensionClassifier),
        config: EngineConfig {
            file_type_filter,
            ..EngineConfig::default()
        },
        event_sink: Arc::new(TracingEventSink),
        confirm_retag_source: false,
    }
}

/// S1 Fresh copy: two empty destinations each receive every manifest entry,
/// `COPIED` and `VERIFIED`, and mirror the source tree exactly.
#[tokio::test]
async fn s1_fresh_copy_to_two_destinations() {
    let source = TempDir::new().unwrap();
    let dest1 = TempDir::new().unwrap();
    let dest2 = TempDir::new().unwrap();

    fs::write(source.path().join("a.jpg"), vec![1u8; 1024]).unwrap();
    fs::create_dir(source.path().join("video")).unwrap();
    fs::write(source.path().join("video/b.mov"), vec![2u8; 4096]).unwrap();
    fs::write(source.path().join("c.nef"), vec![3u8; 2048]).unwrap();

    let orchestrator = Orchestrator::new();
    let report = orchestrator
        .run(request(
            source.path(),
            vec![dest1.path().to_path_buf(), dest2.path().to_path_buf()],
            HashSet::new(),
        ))
        .await
        .unwrap();

    assert_eq!(report.session.status, SessionStatus::Completed);
    assert_eq!(report.manifest_len, 3);

    for dest in [&dest1, &dest2] {
        assert!(dest.path().join("a.jpg").exists());
        assert!(dest.path().join("video/b.mov").exists());
        assert!(dest.path().join("c.nef").exists());
    }
    for state in &report.destinations {
        assert_eq!(state.counters.copied, 3);
        assert_eq!(state.counters.verified, 3);
        assert_eq!(state.counters.failed, 0);
    }
}

/// S2 Resume: re-running over an unchanged source produces zero `COPIED`
/// actions and every file reported `SKIPPED`.
#[tokio::test]
async fn s2_resume_skips_unchanged_files() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    fs::write(source.path().join("a.jpg"), vec![1u8; 512]).unwrap();
    fs::write(source.path().join("c.nef"), vec![2u8; 512]).unwrap();

    let first = Orchestrator::new()
        .run(request(source.path(), vec![dest.path().to_path_buf()], HashSet::new()))
        .await
        .unwrap();
    assert_eq!(first.destinations[0].counters.copied, 2);

    let second = Orchestrator::new()
        .run(request(source.path(), vec![dest.path().to_path_buf()], HashSet::new()))
        .await
        .unwrap();

    assert_eq!(second.session.status, SessionStatus::Completed);
    assert_eq!(second.destinations[0].counters.copied, 0);
    assert_eq!(second.destinations[0].counters.skipped, 2);
}

/// S3 Conflict: a destination file with the source's size but different
/// content is quarantined, then the correct content is copied and verified;
/// an unaffected destination simply skips.
#[tokio::test]
async fn s3_conflicting_file_is_quarantined_then_replaced() {
    let source = TempDir::new().unwrap();
    let dest1 = TempDir::new().unwrap();
    let dest2 = TempDir::new().unwrap();
    let content = vec![7u8; 1024];
    fs::write(source.path().join("a.jpg"), &content).unwrap();

    Orchestrator::new()
        .run(request(
            source.path(),
            vec![dest1.path().to_path_buf(), dest2.path().to_path_buf()],
            HashSet::new(),
        ))
        .await
        .unwrap();

    // Corrupt dest1's copy with same-size garbage; dest2 is untouched.
    fs::write(dest1.path().join("a.jpg"), vec![0xFFu8; 1024]).unwrap();

    let report = Orchestrator::new()
        .run(request(
            source.path(),
            vec![dest1.path().to_path_buf(), dest2.path().to_path_buf()],
            HashSet::new(),
        ))
        .await
        .unwrap();

    assert_eq!(report.session.status, SessionStatus::Completed);

    let dest1_state = report
        .destinations
        .iter()
        .find(|d| d.mount_path == dest1.path())
        .unwrap();
    assert_eq!(dest1_state.counters.copied, 1);
    assert_eq!(dest1_state.counters.quarantined, 1);
    assert_eq!(dest1_state.counters.verified, 1);

    let dest2_state = report
        .destinations
        .iter()
        .find(|d| d.mount_path == dest2.path())
        .unwrap();
    assert_eq!(dest2_state.counters.skipped, 1);
    assert_eq!(dest2_state.counters.copied, 0);

    assert_eq!(fs::read(dest1.path().join("a.jpg")).unwrap(), content);

    let quarantine_dir = dest1.path().join(".imageintact_quarantine");
    let entries: Vec<_> = fs::read_dir(&quarantine_dir).unwrap().collect();
    assert_eq!(entries.len(), 1);
    let quarantined_path = entries.into_iter().next().unwrap().unwrap().path();
    assert_eq!(fs::read(quarantined_path).unwrap(), vec![0xFFu8; 1024]);
}

/// S5 Filtered: a non-empty `file_type_filter` admits only the matching
/// extension into the manifest and onto every destination.
#[tokio::test]
async fn s5_type_filter_restricts_manifest() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    fs::write(source.path().join("a.jpg"), vec![1u8; 256]).unwrap();
    fs::create_dir(source.path().join("video")).unwrap();
    fs::write(source.path().join("video/b.mov"), vec![2u8; 256]).unwrap();
    fs::write(source.path().join("c.nef"), vec![3u8; 256]).unwrap();

    let mut filter = HashSet::new();
    filter.insert("nef".to_string());

    let report = Orchestrator::new()
        .run(request(source.path(), vec![dest.path().to_path_buf()], filter))
        .await
        .unwrap();

    assert_eq!(report.manifest_len, 1);
    assert!(dest.path().join("c.nef").exists());
    assert!(!dest.path().join("a.jpg").exists());
    assert!(!dest.path().join("video/b.mov").exists());
}

/// S4 Cancel: cancelling shortly after a run starts drains every worker and
/// seals the session as `cancelled`; no destination counter invariant is
/// violated and every file on every destination ends up accounted for.
#[tokio::test]
async fn s4_cancel_mid_run_drains_cleanly() {
    let source = TempDir::new().unwrap();
    let dest1 = TempDir::new().unwrap();
    let dest2 = TempDir::new().unwrap();
    for i in 0..40 {
        fs::write(source.path().join(format!("f{i}.jpg")), vec![i as u8; 4096]).unwrap();
    }

    let orchestrator = Arc::new(Orchestrator::new());
    let run_orchestrator = orchestrator.clone();
    let req = request(
        source.path(),
        vec![dest1.path().to_path_buf(), dest2.path().to_path_buf()],
        HashSet::new(),
    );
    let handle = tokio::spawn(async move { run_orchestrator.run(req).await });

    orchestrator.cancel();
    let report = handle.await.unwrap().unwrap();

    assert!(matches!(
        report.session.status,
        SessionStatus::Cancelled | SessionStatus::Completed | SessionStatus::CompletedWithErrors
    ));
    for state in &report.destinations {
        assert_eq!(
            state.counters.copied + state.counters.skipped + state.counters.failed,
            state.total_files
        );
        assert!(state.counters.verified <= state.counters.copied + state.counters.skipped);
    }
}

/// Two destinations with independent per-session manifests: each lists
/// exactly its own `COPIED`/`SKIPPED`/`VERIFIED` entries, never the other's.
#[tokio::test]
async fn per_destination_manifest_files_are_independent() {
    let source = TempDir::new().unwrap();
    let dest1 = TempDir::new().unwrap();
    let dest2 = TempDir::new().unwrap();
    fs::write(source.path().join("a.jpg"), vec![1u8; 128]).unwrap();

    Orchestrator::new()
        .run(request(
            source.path(),
            vec![dest1.path().to_path_buf(), dest2.path().to_path_buf()],
            HashSet::new(),
        ))
        .await
        .unwrap();

    for dest in [&dest1, &dest2] {
        let checksums_dir = dest.path().join(".imageintact_checksums");
        let manifests: Vec<_> = fs::read_dir(&checksums_dir).unwrap().collect();
        assert_eq!(manifests.len(), 1);
    }
}

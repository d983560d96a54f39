//! imageintact-engine CLI — the concrete "User interface" collaborator
//! for a one-shot backup run.
//!
//! Startup sequence: parse args → load config → init logging → construct
//! shared state → run → wait for a shutdown signal → drain. The process
//! exits once the orchestrator reaches `Phase::Complete`.

use anyhow::{Context, Result};
use clap::Parser;
use imageintact_engine::collaborators::{
    DestinationProbe, DrivePane, EventSink, ExtensionClassifier, FilteredEventSink, LogLevel,
    TracingEventSink, UnknownDrivePane,
};
use imageintact_engine::config::Config;
use imageintact_engine::daemon::shutdown::ShutdownCoordinator;
use imageintact_engine::orchestrator::{
    spot_check_digest, BackupRequest, DestinationTarget, Orchestrator,
};
use imageintact_engine::session::SessionStatus;
use imageintact_engine::utils;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "Integrity-verified, multi-destination backup engine", long_about = None)]
struct Args {
    /// Source tree to back up.
    #[arg(long)]
    source: PathBuf,

    /// One or more destination trees; each receives an independent copy.
    #[arg(long = "destination", required = true, num_args = 1..)]
    destinations: Vec<PathBuf>,

    /// Path to a TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Restrict the backup to these lowercase extensions (comma-separated).
    /// Empty (the default) includes every supported extension.
    #[arg(long, value_delimiter = ',')]
    file_types: Vec<String>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Confirm re-tagging a destination previously marked as a source.
    /// Without this flag the run refuses such a destination.
    #[arg(long)]
    confirm_retag_source: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).context("loading configuration file")?,
        None => Config::default(),
    };
    if !args.file_types.is_empty() {
        config.engine.file_type_filter = args
            .file_types
            .iter()
            .map(|e| e.to_ascii_lowercase())
            .collect::<HashSet<_>>();
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "imageintact-engine v{} starting session (source: {})",
        env!("CARGO_PKG_VERSION"),
        args.source.display()
    );

    let classifier = Arc::new(ExtensionClassifier);
    let drive_probe = Arc::new(UnknownDrivePane);
    let minimum_log_level = LogLevel::parse(&config.engine.minimum_log_level);
    let event_sink: Arc<dyn EventSink> = Arc::new(FilteredEventSink::new(
        Arc::new(TracingEventSink),
        minimum_log_level,
    ));

    if config.engine.show_preflight_summary {
        run_preflight_summary(&args.source, &event_sink);
    }

    let destinations = args
        .destinations
        .iter()
        .map(|mount_path| probe_destination(drive_probe.as_ref(), mount_path))
        .collect();

    let request = BackupRequest {
        source_root: args.source.clone(),
        destinations,
        classifier,
        config: config.engine.clone(),
        event_sink: event_sink.clone(),
        confirm_retag_source: args.confirm_retag_source,
    };

    let orchestrator = Arc::new(Orchestrator::new());
    let shutdown = ShutdownCoordinator::new();

    let run_orchestrator = orchestrator.clone();
    let mut run_handle = tokio::spawn(async move { run_orchestrator.run(request).await });

    let report = tokio::select! {
        res = &mut run_handle => res.context("orchestrator task panicked")??,
        _ = shutdown.wait_for_signal() => {
            orchestrator.cancel();
            shutdown.shutdown().await;
            run_handle.await.context("orchestrator task panicked")??
        }
    };

    for failure in &report.failures {
        event_sink.log(
            LogLevel::Error,
            "session",
            &format!("{} -> {}: {}", failure.source, failure.destination, failure.reason),
        );
    }

    tracing::info!(
        "session {} finished with status {:?}: {} files, {} destinations, {} failures",
        report.session.session_id,
        report.session.status,
        report.manifest_len,
        report.destinations.len(),
        report.failures.len(),
    );

    std::process::exit(match report.session.status {
        SessionStatus::Completed => 0,
        SessionStatus::CompletedWithErrors => 1,
        SessionStatus::Cancelled => 130,
        SessionStatus::Running => unreachable!("session is sealed before main reads its status"),
    });
}

/// Spot-checks one source file before committing to a full run: confirms the
/// tree is readable and surfaces a concrete digest the user can sanity-check
/// against a prior backup, without the cost of hashing the whole manifest.
fn run_preflight_summary(source: &Path, event_sink: &Arc<dyn EventSink>) {
    let cancel = CancellationToken::new();
    match first_file(source) {
        Some(path) => match spot_check_digest(&path, &cancel) {
            Ok(digest) => event_sink.log(
                LogLevel::Info,
                "preflight",
                &format!("source readable; spot-checked {} ({digest})", path.display()),
            ),
            Err(e) => event_sink.log(
                LogLevel::Warning,
                "preflight",
                &format!("spot-check failed for {}: {e}", path.display()),
            ),
        },
        None => event_sink.log(
            LogLevel::Warning,
            "preflight",
            "source tree has no readable files to spot-check",
        ),
    }
}

fn first_file(root: &Path) -> Option<PathBuf> {
    walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().to_path_buf())
}

fn probe_destination(drive_probe: &dyn DrivePane, mount_path: &PathBuf) -> DestinationTarget {
    let DestinationProbe {
        medium_class,
        free_bytes,
        ..
    } = drive_probe.probe(mount_path);
    DestinationTarget {
        mount_path: mount_path.clone(),
        medium_class,
        free_bytes,
    }
}

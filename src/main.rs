use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zone_guard::audio::{BackendProbe, MicrophoneFactory, SimulatedFactory};
use zone_guard::config::expand_path;
use zone_guard::{BackendClient, BackendFactory, Collaborators, Config, MonitorEvent, RecordingSession};

#[derive(Parser)]
#[command(name = "zone-guard")]
#[command(about = "Record a monitored zone and analyse it for danger sounds")]
struct Args {
    /// Configuration file (TOML); defaults to config/zone-guard.toml if present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use a synthetic tone instead of the microphone
    #[arg(long)]
    simulate: bool,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(short, long)]
    duration: Option<u64>,

    /// Directory finished recordings are exported to
    /// (default: recording.export_dir, else ./recordings)
    #[arg(short, long)]
    export_dir: Option<String>,
}

/// Used when neither the command line nor the config names an export dir
const DEFAULT_EXPORT_DIR: &str = "recordings";

fn resolve_export_dir(cli: Option<&str>, configured: Option<PathBuf>) -> PathBuf {
    match (cli, configured) {
        (Some(dir), _) => expand_path(Path::new(dir)),
        (None, Some(dir)) => dir,
        (None, None) => PathBuf::from(DEFAULT_EXPORT_DIR),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = Config::load(args.config.as_deref())?;
    init_logging(&cfg.service.log_filter);

    let export_dir = resolve_export_dir(args.export_dir.as_deref(), cfg.recording.export_dir.take());
    cfg.recording.export_dir = Some(export_dir);

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));
    info!("Backend API: {}", cfg.remote.base_url);
    info!(
        "Zone {}: {} ({})",
        cfg.zone.id, cfg.zone.name, cfg.zone.area
    );
    if let Some(dir) = &cfg.recording.export_dir {
        info!("Recordings will be exported to {}", dir.display());
    }

    let client = BackendClient::new(&cfg.remote).context("Failed to build backend client")?;
    let backends: Arc<dyn BackendFactory> = if args.simulate {
        info!("Using simulated audio input");
        Arc::new(SimulatedFactory::new(BackendProbe::new()))
    } else {
        Arc::new(MicrophoneFactory)
    };

    let session = RecordingSession::new(cfg.session_config(), Collaborators::remote(backends, client));

    let event_log = tokio::spawn(log_events(session.subscribe()));
    let mut lost = session.subscribe();

    let run_id = session
        .start()
        .await
        .context("Failed to start recording")?;

    match args.duration {
        Some(secs) => info!("Recording {} for {} seconds", run_id, secs),
        None => info!("Recording {}; press Ctrl+C to stop", run_id),
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, stopping"),
        _ = wait_for(args.duration) => info!("Duration elapsed, stopping"),
        _ = source_lost(&mut lost) => warn!("Audio input lost, recording finalized early"),
    }

    let artifact = match session.stop().await? {
        Some(artifact) => Some(artifact),
        None => session.last_artifact(),
    };
    if let Some(artifact) = &artifact {
        info!(
            "Recording finished: {} ({} bytes, {} seconds)",
            artifact.file_name(),
            artifact.len(),
            session.elapsed_secs()
        );
    }

    for report in session.flush_persistence().await {
        if report.errors.is_empty() {
            info!(
                "Persistence of {} done (exported: {}, uploaded: {}, pruned: {})",
                report.file_name,
                report.exported.is_some(),
                report.uploaded,
                report.pruned
            );
        } else {
            warn!(
                "Persistence of {} finished with {} errors",
                report.file_name,
                report.errors.len()
            );
        }
    }

    let status = session.status();
    info!(
        "Zone {} is {} ({} analyses, {} failed, {} skipped)",
        status.zone.name,
        status.zone.status,
        status.analysis.dispatched,
        status.analysis.failed,
        status.analysis.skipped
    );

    drop(session);
    event_log.abort();

    Ok(())
}

fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn wait_for(duration: Option<u64>) {
    match duration {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => std::future::pending().await,
    }
}

async fn source_lost(events: &mut broadcast::Receiver<MonitorEvent>) {
    loop {
        match events.recv().await {
            Ok(MonitorEvent::SourceLost { .. }) => return,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return std::future::pending().await,
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<MonitorEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(missed)) => warn!("Event log lagged, {} events missed", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::StateChanged { state } => info!("Session {}", state),
        MonitorEvent::AcquisitionFailed { error: e } => error!("Microphone unavailable: {}", e),
        MonitorEvent::SourceLost { error: e } => warn!("Audio input lost: {}", e),
        MonitorEvent::DangerDetected {
            zone_id,
            label,
            danger_probability,
            at,
            ..
        } => warn!(
            "ALERT zone {}: {} (probability {:.2}) at {}",
            zone_id,
            label.as_deref().unwrap_or("unknown"),
            danger_probability.unwrap_or_default(),
            at.format("%H:%M:%S")
        ),
        MonitorEvent::AnalysisDegraded {
            consecutive_failures,
        } => warn!(
            "Analysis degraded: {} consecutive failures",
            consecutive_failures
        ),
        MonitorEvent::AnalysisRecovered => info!("Analysis recovered"),
        MonitorEvent::ArtifactReady { file_name, bytes } => {
            info!("Recording ready: {} ({} bytes)", file_name, bytes)
        }
        MonitorEvent::ArtifactExported { path } => info!("Exported {}", path.display()),
        MonitorEvent::Persisted { file_name } => info!("Uploaded {}", file_name),
        MonitorEvent::PersistenceFailed { file_name, error: e } => {
            warn!("Could not persist {}: {}", file_name, e)
        }
    }
}

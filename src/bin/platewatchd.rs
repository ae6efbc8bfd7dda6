//! platewatchd - licence plate watcher daemon
//!
//! This daemon:
//! 1. Loads the stream list and pipeline settings from a JSON config file
//! 2. Runs one capture and one processing loop per enabled stream
//! 3. Saves the best reading of every plate under the output directory
//! 4. Forwards saved readings to each stream's downstream receiver, if any
//! 5. Reloads the stream list when the config file changes

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::{Duration, SystemTime};

use plate_watch::detect::BackendRegistry;
use plate_watch::transport::DEFAULT_DISPATCH_QUEUE;
use plate_watch::{
    DefaultSourceFactory, DisplaySink, DownstreamDispatcher, EventKind, EventSink,
    FilesystemPlateStore, FleetManager, PlateArchive, PlateWatchConfig, StreamServices,
    TcpDownstreamSender,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Watch video streams for licence plates")]
struct Args {
    /// JSON config file. Defaults apply when omitted.
    #[arg(long, env = "PLATEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// How often the config file is checked for changes.
    #[arg(long, default_value_t = 2000)]
    reload_interval_ms: u64,

    /// Print the available detector and recognizer backends and exit.
    #[arg(long)]
    list_backends: bool,
}

fn modified(path: Option<&Path>) -> Option<SystemTime> {
    path.and_then(|p| std::fs::metadata(p).ok())
        .and_then(|m| m.modified().ok())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let registry = BackendRegistry::with_stub_backends();
    if args.list_backends {
        println!("detectors: {}", registry.list_detectors().join(", "));
        println!("recognizers: {}", registry.list_recognizers().join(", "));
        return Ok(());
    }

    let config_path = args.config.as_deref();
    let cfg = PlateWatchConfig::load_from(config_path)?;
    let mut last_modified = modified(config_path);

    let store = FilesystemPlateStore::open(&cfg.output_dir)?;
    let archive = Arc::new(PlateArchive::open(Arc::new(store), cfg.min_save_confidence)?);
    log::info!(
        "platewatchd: {} plates already on record in {}",
        archive.len(),
        cfg.output_dir.display()
    );

    let dispatcher = DownstreamDispatcher::spawn(
        Box::new(TcpDownstreamSender::default()),
        DEFAULT_DISPATCH_QUEUE,
    )?
    .with_join_timeout(cfg.pipeline_settings().join_timeout);
    let (events, event_rx) = EventSink::channel(256);
    std::thread::Builder::new()
        .name("events".into())
        .spawn(move || {
            for event in event_rx {
                match event.kind {
                    EventKind::Status(status) => {
                        log::info!("[{}] {}", event.stream_id, status)
                    }
                    EventKind::Warning(message) => {
                        log::warn!("[{}] {}", event.stream_id, message)
                    }
                    EventKind::PlateSaved { plate, confidence } => {
                        log::info!("[{}] saved {} ({:.2})", event.stream_id, plate, confidence)
                    }
                }
            }
        })
        .context("spawn event logger")?;

    let services = StreamServices {
        sources: Arc::new(DefaultSourceFactory),
        detector: registry.detector(Some(&cfg.detector_backend))?,
        recognizer: registry.recognizer(cfg.recognizer_backend.as_deref())?,
        archive,
        downstream: Some(Arc::new(dispatcher)),
        display: DisplaySink::disabled(),
        events,
    };
    let mut fleet = FleetManager::new(cfg.pipeline_settings(), services);
    let summary = fleet.reconcile(&cfg.resolved_streams());
    log::info!(
        "platewatchd: {} streams started, {} failed",
        summary.started.len(),
        summary.failed.len()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    let interval = Duration::from_millis(args.reload_interval_ms.max(100));
    loop {
        match rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        let current = modified(config_path);
        if current == last_modified {
            continue;
        }
        last_modified = current;
        match PlateWatchConfig::load_from(config_path) {
            Ok(reloaded) => {
                let summary = fleet.reconcile(&reloaded.resolved_streams());
                log::info!(
                    "platewatchd: config reloaded (started {:?}, stopped {:?}, updated {:?}, restarted {:?})",
                    summary.started,
                    summary.stopped,
                    summary.updated,
                    summary.restarted
                );
            }
            Err(err) => log::warn!("platewatchd: ignoring invalid config: {:#}", err),
        }
    }

    log::info!("shutdown signal received, stopping streams...");
    for (id, status) in fleet.statuses() {
        log::debug!("platewatchd: {} was {}", id, status);
    }
    fleet.shutdown();
    Ok(())
}

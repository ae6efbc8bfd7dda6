//! plate_receiver - accept plate bundles from platewatchd
//!
//! Each connection carries one bundle (vehicle image, plate image, metadata). Bundles are
//! written to `<output>/<timestamp>/`. Connections are handled concurrently on a worker
//! pool; Ctrl-C stops accepting and exits.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use plate_watch::{BundleReceiver, CancelToken};

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive saved plates from platewatchd")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "PLATE_RECEIVER_ADDR", default_value = "0.0.0.0:5000")]
    listen: String,

    /// Directory bundles are written under.
    #[arg(long, env = "PLATE_RECEIVER_DIR", default_value = "ReceivedData")]
    output: PathBuf,

    /// Per-connection read timeout in seconds.
    #[arg(long, default_value_t = 30)]
    read_timeout_secs: u64,

    /// Connections read at the same time.
    #[arg(long, env = "PLATE_RECEIVER_WORKERS", default_value_t = 8)]
    workers: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let listener =
        TcpListener::bind(&args.listen).with_context(|| format!("bind {}", args.listen))?;
    let receiver = BundleReceiver::new(&args.output)
        .with_read_timeout(Duration::from_secs(args.read_timeout_secs.max(1)))
        .with_workers(args.workers);
    log::info!(
        "plate_receiver listening on {} with {} workers, writing to {}",
        listener.local_addr()?,
        args.workers.max(1),
        args.output.display()
    );

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || on_signal.cancel()).context("error setting Ctrl-C handler")?;

    receiver.serve(listener, &cancel)?;
    log::info!("plate_receiver stopped");
    Ok(())
}

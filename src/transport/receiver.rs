use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, TrySendError};
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::{join_within, CancelToken};

use super::downstream::{read_bundle, store_bundle, BundleLimits};

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const BACKLOG_PER_WORKER: usize = 4;

/// Accepts plate bundles and stores each under `<root>/<timestamp>/`.
///
/// Connections are read on a fixed pool of workers, so a slow or stalled client only
/// holds one worker for at most `read_timeout`.
#[derive(Clone, Debug)]
pub struct BundleReceiver {
    root: PathBuf,
    limits: BundleLimits,
    read_timeout: Duration,
    workers: usize,
    join_timeout: Duration,
}

impl BundleReceiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            limits: BundleLimits::default(),
            read_timeout: Duration::from_secs(30),
            workers: 8,
            join_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_limits(mut self, limits: BundleLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serve `listener` until `cancel` fires.
    pub fn serve(&self, listener: TcpListener, cancel: &CancelToken) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("create {}", self.root.display()))?;
        listener
            .set_nonblocking(true)
            .context("set listener nonblocking")?;

        let (tx, rx) = bounded::<TcpStream>(self.workers * BACKLOG_PER_WORKER);
        let mut workers = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            workers.push(self.spawn_worker(index, rx.clone())?);
        }
        drop(rx);

        while !cancel.is_cancelled() {
            match listener.accept() {
                Ok((stream, peer)) => match tx.try_send(stream) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::warn!("BundleReceiver: all workers busy, dropping {}", peer)
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        log::error!("BundleReceiver: workers gone");
                        break;
                    }
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    cancel.sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    log::warn!("BundleReceiver: accept failed: {}", err);
                    cancel.sleep(ACCEPT_POLL);
                }
            }
        }

        drop(tx);
        for (index, worker) in workers.into_iter().enumerate() {
            join_within(
                worker,
                self.join_timeout,
                &format!("BundleReceiver worker {}", index),
            );
        }
        Ok(())
    }

    fn spawn_worker(&self, index: usize, rx: Receiver<TcpStream>) -> Result<JoinHandle<()>> {
        let receiver = self.clone();
        std::thread::Builder::new()
            .name(format!("bundle-rx-{}", index))
            .spawn(move || {
                for mut stream in rx.iter() {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "unknown".into());
                    match receiver.handle(&mut stream) {
                        Ok(dir) => log::info!(
                            "BundleReceiver: bundle from {} stored in {}",
                            peer,
                            dir.display()
                        ),
                        Err(err) => {
                            log::warn!("BundleReceiver: bundle from {} rejected: {:#}", peer, err)
                        }
                    }
                }
            })
            .context("spawn bundle receiver worker")
    }

    fn handle(&self, stream: &mut TcpStream) -> Result<PathBuf> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        let files = read_bundle(stream, self.limits)?;
        store_bundle(&self.root, &files)
    }
}

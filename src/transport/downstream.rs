//! Bundle framing, the TCP sender and the non-blocking dispatcher.
//!
//! Framing (one bundle per connection):
//!
//! ```text
//! u32 big-endian header length
//! header: JSON array [{"Name": "...", "Size": n, "Type": "image/jpeg"}, ...]
//! file bytes, in header order
//! ```

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::join_within;
use crate::error::{PipelineError, PipelineResult};
use crate::plates::SavedArtifacts;

pub const MAX_HEADER_LEN: usize = 10 * 1024 * 1024;
pub const MAX_FILE_LEN: u64 = 100 * 1024 * 1024;
pub const DEFAULT_DISPATCH_QUEUE: usize = 32;
pub const DEFAULT_DISPATCH_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownstreamTarget {
    pub host: String,
    pub port: u16,
}

impl DownstreamTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `[v6]:port` or `tcp://host:port`.
    pub fn parse(addr: &str) -> Result<Self> {
        let mut remainder = addr.trim();
        if let Some((scheme, rest)) = remainder.split_once("://") {
            if scheme != "tcp" {
                bail!("unsupported downstream scheme: {}", scheme);
            }
            remainder = rest;
        }
        let (host, port) = if let Some(rest) = remainder.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| anyhow!("invalid downstream address: {}", addr))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("missing downstream port in {}", addr))?;
            (host, port)
        } else {
            remainder
                .rsplit_once(':')
                .ok_or_else(|| anyhow!("missing downstream port in {}", addr))?
        };
        if host.is_empty() {
            bail!("missing downstream host in {}", addr);
        }
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid downstream port in {}", addr))?;
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for DownstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One header entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Type")]
    pub content_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingFile {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl OutgoingFile {
    /// Read `path` from disk; the bundle name is its final component.
    pub fn from_path(path: &Path, content_type: &str) -> Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        Ok(Self {
            name: sanitize_file_name(&path.to_string_lossy()),
            content_type: content_type.to_string(),
            data,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Sanitised file name.
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

pub fn write_bundle<W: Write>(writer: &mut W, files: &[OutgoingFile]) -> Result<()> {
    let headers: Vec<FileHeader> = files
        .iter()
        .map(|f| FileHeader {
            name: f.name.clone(),
            size: f.data.len() as u64,
            content_type: f.content_type.clone(),
        })
        .collect();
    let header = serde_json::to_vec(&headers).context("encode bundle header")?;
    let header_len = u32::try_from(header.len()).context("bundle header too large")?;
    writer.write_all(&header_len.to_be_bytes())?;
    writer.write_all(&header)?;
    for file in files {
        writer.write_all(&file.data)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BundleLimits {
    pub max_header_len: usize,
    pub max_file_len: u64,
}

impl Default for BundleLimits {
    fn default() -> Self {
        Self {
            max_header_len: MAX_HEADER_LEN,
            max_file_len: MAX_FILE_LEN,
        }
    }
}

pub fn read_bundle<R: Read>(reader: &mut R, limits: BundleLimits) -> Result<Vec<ReceivedFile>> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .context("read bundle header length")?;
    let header_len = u32::from_be_bytes(len_bytes) as usize;
    if header_len == 0 || header_len > limits.max_header_len {
        bail!("invalid bundle header length {}", header_len);
    }
    let mut header = vec![0u8; header_len];
    reader
        .read_exact(&mut header)
        .context("read bundle header")?;
    let headers: Vec<FileHeader> =
        serde_json::from_slice(&header).context("decode bundle header")?;

    let mut files = Vec::with_capacity(headers.len());
    for entry in headers {
        if entry.size == 0 || entry.size > limits.max_file_len {
            bail!("file '{}' has invalid size {}", entry.name, entry.size);
        }
        let mut data = Vec::new();
        reader
            .by_ref()
            .take(entry.size)
            .read_to_end(&mut data)
            .with_context(|| format!("read file '{}'", entry.name))?;
        if data.len() as u64 != entry.size {
            bail!(
                "file '{}' truncated: {} of {} bytes",
                entry.name,
                data.len(),
                entry.size
            );
        }
        files.push(ReceivedFile {
            name: sanitize_file_name(&entry.name),
            content_type: entry.content_type,
            data,
        });
    }
    Ok(files)
}

/// Final path component with anything outside `[A-Za-z0-9._-]` replaced by `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let clean: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if clean.is_empty() || clean.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        clean
    }
}

/// Write a received bundle into `<root>/<YYYYmmddHHMMSSmmm>/`. Returns that directory.
pub fn store_bundle(root: &Path, files: &[ReceivedFile]) -> Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%3f").to_string();
    std::fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
    let mut dir = root.join(&stamp);
    let mut suffix = 1;
    // create_dir fails on an existing name, so concurrent writers never share a directory.
    loop {
        match std::fs::create_dir(&dir) {
            Ok(()) => break,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                dir = root.join(format!("{}_{}", stamp, suffix));
                suffix += 1;
            }
            Err(err) => return Err(err).with_context(|| format!("create {}", dir.display())),
        }
    }
    for file in files {
        let path = dir.join(&file.name);
        std::fs::write(&path, &file.data).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(dir)
}

/// Hands saved artifacts to a downstream receiver.
pub trait DownstreamSender: Send {
    fn send(&mut self, target: &DownstreamTarget, artifacts: &SavedArtifacts) -> PipelineResult<()>;
}

pub struct TcpDownstreamSender {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpDownstreamSender {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }

    fn bundle(artifacts: &SavedArtifacts) -> Result<Vec<OutgoingFile>> {
        Ok(vec![
            OutgoingFile::from_path(&artifacts.vehicle_image, "image/jpeg")?,
            OutgoingFile::from_path(&artifacts.plate_image, "image/jpeg")?,
            OutgoingFile::from_path(&artifacts.metadata, "text/plain")?,
        ])
    }

    fn deliver(&self, target: &DownstreamTarget, files: &[OutgoingFile]) -> Result<()> {
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}", target))?
            .next()
            .ok_or_else(|| anyhow!("{} did not resolve", target))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .with_context(|| format!("connect to {}", target))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        write_bundle(&mut stream, files)
    }
}

impl Default for TcpDownstreamSender {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

impl DownstreamSender for TcpDownstreamSender {
    fn send(&mut self, target: &DownstreamTarget, artifacts: &SavedArtifacts) -> PipelineResult<()> {
        let files = Self::bundle(artifacts).map_err(|err| PipelineError::downstream(format!("{:#}", err)))?;
        self.deliver(target, &files)
            .map_err(|err| PipelineError::downstream(format!("{:#}", err)))
    }
}

struct DispatchJob {
    stream_id: String,
    target: DownstreamTarget,
    artifacts: SavedArtifacts,
}

/// Fire-and-forget delivery on a single worker thread.
///
/// `dispatch` never blocks the caller; a full queue drops the bundle with a warning.
/// `shutdown` discards queued bundles and waits at most `join_timeout` for the one in
/// flight.
pub struct DownstreamDispatcher {
    tx: Option<Sender<DispatchJob>>,
    pending: Receiver<DispatchJob>,
    worker: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl DownstreamDispatcher {
    pub fn spawn(mut sender: Box<dyn DownstreamSender>, capacity: usize) -> Result<Self> {
        let (tx, rx) = bounded::<DispatchJob>(capacity.max(1));
        let pending = rx.clone();
        let worker = std::thread::Builder::new()
            .name("downstream".to_string())
            .spawn(move || {
                for job in rx.iter() {
                    match sender.send(&job.target, &job.artifacts) {
                        Ok(()) => log::info!(
                            "DownstreamDispatcher[{}]: sent {} to {}",
                            job.stream_id,
                            job.artifacts.plate,
                            job.target
                        ),
                        Err(err) => log::warn!(
                            "DownstreamDispatcher[{}]: {} not delivered to {}: {}",
                            job.stream_id,
                            job.artifacts.plate,
                            job.target,
                            err
                        ),
                    }
                }
                log::debug!("DownstreamDispatcher: worker exiting");
            })
            .context("spawn downstream worker")?;
        Ok(Self {
            tx: Some(tx),
            pending,
            worker: Some(worker),
            join_timeout: DEFAULT_DISPATCH_JOIN_TIMEOUT,
        })
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Queue a delivery. Returns `false` when it was dropped.
    pub fn dispatch(&self, stream_id: &str, target: &DownstreamTarget, artifacts: &SavedArtifacts) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let job = DispatchJob {
            stream_id: stream_id.to_string(),
            target: target.clone(),
            artifacts: artifacts.clone(),
        };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                log::warn!(
                    "DownstreamDispatcher[{}]: queue full, dropping {}",
                    stream_id,
                    job.artifacts.plate
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Stop accepting work, discard queued bundles and wait (bounded) for the worker.
    pub fn shutdown(&mut self) {
        self.tx.take();
        let discarded = self.pending.try_iter().count();
        if discarded > 0 {
            log::warn!("DownstreamDispatcher: discarded {} queued bundles", discarded);
        }
        if let Some(worker) = self.worker.take() {
            join_within(worker, self.join_timeout, "DownstreamDispatcher");
        }
    }
}

impl Drop for DownstreamDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    fn file(name: &str, data: &[u8]) -> OutgoingFile {
        OutgoingFile {
            name: name.to_string(),
            content_type: "text/plain".to_string(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn header_uses_capitalised_keys() -> Result<()> {
        let mut buf = Vec::new();
        write_bundle(&mut buf, &[file("a.txt", b"hello")])?;
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let header = std::str::from_utf8(&buf[4..4 + len])?;
        assert_eq!(header, r#"[{"Name":"a.txt","Size":5,"Type":"text/plain"}]"#);
        assert_eq!(&buf[4 + len..], b"hello");
        Ok(())
    }

    #[test]
    fn bundle_decodes_in_order() -> Result<()> {
        let mut buf = Vec::new();
        write_bundle(&mut buf, &[file("one.jpg", b"\xff\xd8"), file("../../etc/passwd", b"x")])?;
        let files = read_bundle(&mut Cursor::new(buf), BundleLimits::default())?;
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].data, b"\xff\xd8");
        assert_eq!(files[1].name, "passwd");
        Ok(())
    }

    #[test]
    fn limits_are_enforced() -> Result<()> {
        let mut buf = Vec::new();
        write_bundle(&mut buf, &[file("big.bin", &[7u8; 64])])?;
        let limits = BundleLimits {
            max_header_len: MAX_HEADER_LEN,
            max_file_len: 32,
        };
        assert!(read_bundle(&mut Cursor::new(buf.clone()), limits).is_err());

        let tiny = BundleLimits {
            max_header_len: 8,
            max_file_len: MAX_FILE_LEN,
        };
        assert!(read_bundle(&mut Cursor::new(buf.clone()), tiny).is_err());

        // Truncated payload
        buf.truncate(buf.len() - 10);
        assert!(read_bundle(&mut Cursor::new(buf), BundleLimits::default()).is_err());

        let mut empty = Vec::new();
        write_bundle(&mut empty, &[file("empty.txt", b"")])?;
        assert!(read_bundle(&mut Cursor::new(empty), BundleLimits::default()).is_err());
        Ok(())
    }

    #[test]
    fn sanitises_names() {
        assert_eq!(sanitize_file_name("C:\\temp\\AB12_plate.jpg"), "AB12_plate.jpg");
        assert_eq!(sanitize_file_name("we ird?.txt"), "we_ird_.txt");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name("dir/"), "file");
    }

    #[test]
    fn parses_targets() -> Result<()> {
        assert_eq!(DownstreamTarget::parse("10.0.0.5:9000")?, DownstreamTarget::new("10.0.0.5", 9000));
        assert_eq!(DownstreamTarget::parse("tcp://[::1]:81")?, DownstreamTarget::new("::1", 81));
        assert_eq!(DownstreamTarget::new("::1", 81).to_string(), "[::1]:81");
        assert!(DownstreamTarget::parse("udp://host:1").is_err());
        assert!(DownstreamTarget::parse("host").is_err());
        assert!(DownstreamTarget::parse(":80").is_err());
        Ok(())
    }

    #[test]
    fn tcp_sender_delivers_saved_artifacts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let artifacts = SavedArtifacts {
            plate: "AB12".into(),
            confidence: 0.9,
            vehicle_image: dir.path().join("AB12_vehicle.jpg"),
            plate_image: dir.path().join("AB12_plate.jpg"),
            metadata: dir.path().join("AB12.txt"),
        };
        std::fs::write(&artifacts.vehicle_image, b"vehicle")?;
        std::fs::write(&artifacts.plate_image, b"plate")?;
        std::fs::write(&artifacts.metadata, b"Plate Number: AB12\n")?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let server = std::thread::spawn(move || -> Result<Vec<ReceivedFile>> {
            let (mut stream, _) = listener.accept()?;
            read_bundle(&mut stream, BundleLimits::default())
        });

        let mut sender = TcpDownstreamSender::default();
        sender
            .send(&DownstreamTarget::new("127.0.0.1", port), &artifacts)
            .map_err(|e| anyhow!(e))?;
        let files = server.join().map_err(|_| anyhow!("server panicked"))??;
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["AB12_vehicle.jpg", "AB12_plate.jpg", "AB12.txt"]);
        assert_eq!(files[2].content_type, "text/plain");

        let out = tempfile::tempdir()?;
        let stored = store_bundle(out.path(), &files)?;
        assert_eq!(std::fs::read(stored.join("AB12_plate.jpg"))?, b"plate");
        Ok(())
    }

    struct Recording(Arc<Mutex<Vec<String>>>);

    impl DownstreamSender for Recording {
        fn send(&mut self, target: &DownstreamTarget, artifacts: &SavedArtifacts) -> PipelineResult<()> {
            self.0
                .lock()
                .map_err(|_| PipelineError::downstream("poisoned"))?
                .push(format!("{}@{}", artifacts.plate, target));
            Err(PipelineError::downstream("receiver offline"))
        }
    }

    #[test]
    fn dispatcher_survives_sender_failures() -> Result<()> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = DownstreamDispatcher::spawn(Box::new(Recording(log.clone())), 8)?;
        let artifacts = SavedArtifacts {
            plate: "ZZ1".into(),
            confidence: 0.7,
            vehicle_image: PathBuf::from("v.jpg"),
            plate_image: PathBuf::from("p.jpg"),
            metadata: PathBuf::from("m.txt"),
        };
        let target = DownstreamTarget::new("example.invalid", 1);
        assert!(dispatcher.dispatch("cam", &target, &artifacts));
        assert!(dispatcher.dispatch("cam", &target, &artifacts));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while log.lock().map_err(|_| anyhow!("poisoned"))?.len() < 2
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        dispatcher.shutdown();
        assert_eq!(log.lock().map_err(|_| anyhow!("poisoned"))?.len(), 2);
        assert!(!dispatcher.dispatch("cam", &target, &artifacts));
        Ok(())
    }

    struct Slow {
        started: Arc<Mutex<usize>>,
        delay: Duration,
    }

    impl DownstreamSender for Slow {
        fn send(&mut self, _target: &DownstreamTarget, _artifacts: &SavedArtifacts) -> PipelineResult<()> {
            *self
                .started
                .lock()
                .map_err(|_| PipelineError::downstream("poisoned"))? += 1;
            std::thread::sleep(self.delay);
            Ok(())
        }
    }

    #[test]
    fn shutdown_discards_queue_and_bounds_the_wait() -> Result<()> {
        let started = Arc::new(Mutex::new(0));
        let sender = Slow {
            started: started.clone(),
            delay: Duration::from_millis(500),
        };
        let dispatcher = DownstreamDispatcher::spawn(Box::new(sender), 8)?
            .with_join_timeout(Duration::from_millis(100));
        let artifacts = SavedArtifacts {
            plate: "SL0W".into(),
            confidence: 0.8,
            vehicle_image: PathBuf::from("v.jpg"),
            plate_image: PathBuf::from("p.jpg"),
            metadata: PathBuf::from("m.txt"),
        };
        let target = DownstreamTarget::new("127.0.0.1", 9);
        for _ in 0..4 {
            assert!(dispatcher.dispatch("cam", &target, &artifacts));
        }
        // Let the worker pick up the first bundle.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while *started.lock().map_err(|_| anyhow!("poisoned"))? == 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }

        let begun = std::time::Instant::now();
        drop(dispatcher);
        assert!(begun.elapsed() < Duration::from_millis(400));

        std::thread::sleep(Duration::from_millis(700));
        assert_eq!(*started.lock().map_err(|_| anyhow!("poisoned"))?, 1);
        Ok(())
    }
}

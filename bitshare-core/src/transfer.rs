//! Chunked file transfer over a `PeerLink`.
//!
//! Sender: hash every chunk, send the manifest, wait for `MANIFEST_ACK` (which may
//! list chunks the receiver already has), then keep up to `parallelism` chunks in
//! flight until each is acknowledged. A chunk that is refused or not acknowledged
//! in time is resent after `retry_delay`, at most `retry_count` times.
//!
//! Receiver: validate the manifest, open `<name>.part`, report chunks already on
//! disk, write each verified chunk at its offset, rename on completion.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::channel::{Inbound, PeerLink, TransferStream};
use crate::chunk::{
    plan_chunks, ChunkError, ChunkInfo, ChunkLedger, Manifest, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
};
use crate::integrity::{hash_range, verify_chunk};
use crate::protocol::{ChunkFrame, TransferControl};
use crate::transport::TransportError;

/// Suffix of an unfinished download.
pub const PART_SUFFIX: &str = ".part";

pub type ProgressCallback = Arc<dyn Fn(&FileTransferInfo) + Send + Sync>;

#[derive(Clone)]
pub struct TransferOptions {
    pub chunk_size: u64,
    /// Chunks in flight at once.
    pub parallelism: usize,
    /// Resends per chunk after the first attempt.
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub verify_checksums: bool,
    /// How long to wait for each acknowledgement.
    pub ack_timeout: Duration,
    /// How long a receiver waits for a manifest.
    pub offer_timeout: Duration,
    /// Minimum spacing of progress reports.
    pub progress_interval: Duration,
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallelism: 5,
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            verify_checksums: true,
            ack_timeout: Duration::from_secs(30),
            offer_timeout: Duration::from_secs(5 * 60),
            progress_interval: Duration::from_millis(500),
            progress_callback: None,
        }
    }
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("chunk_size", &self.chunk_size)
            .field("parallelism", &self.parallelism)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("verify_checksums", &self.verify_checksums)
            .field("ack_timeout", &self.ack_timeout)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl TransferOptions {
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_retries(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FileTransferInfo) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::Config("chunk_size must be greater than zero".into()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::Config(format!(
                "chunk_size must be at most {} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        if self.parallelism == 0 {
            return Err(TransferError::Config("parallelism must be at least 1".into()));
        }
        if self.ack_timeout.is_zero() {
            return Err(TransferError::Config("ack_timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Longest a receiver waits for the next chunk: every attempt of one chunk.
    fn chunk_wait(&self) -> Duration {
        (self.ack_timeout + self.retry_delay) * (self.retry_count + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Preparing,
    Transferring,
    Receiving,
    Completed,
    Failed,
}

/// Live state of one transfer, handed to the progress callback.
#[derive(Debug, Clone, Serialize)]
pub struct FileTransferInfo {
    pub file_id: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkInfo>,
    pub total_chunks: u32,
    pub completed_count: u32,
    pub start_time: SystemTime,
    /// Bytes per second over completed chunks.
    pub transfer_rate: f64,
    pub status: TransferStatus,
    pub error: Option<String>,
}

impl FileTransferInfo {
    fn new(file_path: PathBuf, status: TransferStatus) -> Self {
        Self {
            file_id: String::new(),
            file_name: String::new(),
            file_path,
            file_size: 0,
            chunk_size: 0,
            chunks: Vec::new(),
            total_chunks: 0,
            completed_count: 0,
            start_time: SystemTime::now(),
            transfer_rate: 0.0,
            status,
            error: None,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        self.completed_count as f64 * 100.0 / self.total_chunks as f64
    }

    fn mark_completed(&mut self, ledger: &mut ChunkLedger, index: u32) -> bool {
        if !ledger.mark_completed(index) {
            return false;
        }
        if let Some(c) = self.chunks.get_mut(index as usize) {
            c.completed = true;
        }
        self.completed_count = ledger.completed_count();
        true
    }

    fn bytes_completed(&self) -> u64 {
        self.chunks.iter().filter(|c| c.completed).map(|c| c.size).sum()
    }

    fn update_rate(&mut self, started: Instant) {
        let secs = started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.transfer_rate = self.bytes_completed() as f64 / secs;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid transfer options: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk {index} failed checksum verification")]
    ChecksumMismatch { index: u32 },
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("aborted by peer: {0}")]
    Aborted(String),
    #[error("link: {0}")]
    Link(#[from] TransportError),
}

struct Progress {
    callback: Option<ProgressCallback>,
    interval: Duration,
    last: Option<Instant>,
    started: Instant,
}

impl Progress {
    fn new(options: &TransferOptions) -> Self {
        Self {
            callback: options.progress_callback.clone(),
            interval: options.progress_interval,
            last: None,
            started: Instant::now(),
        }
    }

    fn report(&mut self, info: &mut FileTransferInfo, force: bool) {
        info.update_rate(self.started);
        let Some(cb) = &self.callback else { return };
        let due = self.last.map_or(true, |t| t.elapsed() >= self.interval);
        if force || due {
            self.last = Some(Instant::now());
            cb(info);
        }
    }
}

/// First 16 hex digits of SHA-256 over the path and the current time.
pub fn generate_file_id(path: &Path) -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(nanos.to_string().as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(16);
    id
}

/// Final path component of an announced name, if it is a usable file name.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

/// Send `path` to the peer behind `link`.
pub async fn send_file(
    link: &PeerLink,
    path: &Path,
    options: &TransferOptions,
) -> Result<FileTransferInfo, TransferError> {
    options.validate()?;
    let mut info = FileTransferInfo::new(path.to_path_buf(), TransferStatus::Preparing);
    let mut progress = Progress::new(options);
    let mut manifest_sent = false;
    let res = drive_send(link, path, options, &mut info, &mut progress, &mut manifest_sent).await;
    finish(link, info, progress, res, manifest_sent)
}

/// Receive one file from the peer behind `link` into `dest_dir`.
pub async fn receive_file(
    link: &PeerLink,
    dest_dir: &Path,
    options: &TransferOptions,
) -> Result<FileTransferInfo, TransferError> {
    options.validate()?;
    let mut info = FileTransferInfo::new(dest_dir.to_path_buf(), TransferStatus::Preparing);
    let mut progress = Progress::new(options);
    let mut manifest_seen = false;
    let res = drive_receive(link, dest_dir, options, &mut info, &mut progress, &mut manifest_seen).await;
    finish(link, info, progress, res, manifest_seen)
}

fn finish(
    link: &PeerLink,
    mut info: FileTransferInfo,
    mut progress: Progress,
    res: Result<(), TransferError>,
    announce_abort: bool,
) -> Result<FileTransferInfo, TransferError> {
    match res {
        Ok(()) => {
            info.status = TransferStatus::Completed;
            progress.report(&mut info, true);
            info!(
                peer = %link.peer_id(),
                file = %info.file_name,
                bytes = info.file_size,
                rate = info.transfer_rate as u64,
                "transfer completed"
            );
            Ok(info)
        }
        Err(e) => {
            if announce_abort && !matches!(e, TransferError::Aborted(_)) {
                let _ = link.send_transfer(TransferControl::Abort {
                    file_id: info.file_id.clone(),
                    reason: e.to_string(),
                });
            }
            info.status = TransferStatus::Failed;
            info.error = Some(e.to_string());
            progress.report(&mut info, true);
            warn!(peer = %link.peer_id(), file = %info.file_name, "transfer failed: {}", e);
            Err(e)
        }
    }
}

async fn drive_send(
    link: &PeerLink,
    path: &Path,
    options: &TransferOptions,
    info: &mut FileTransferInfo,
    progress: &mut Progress,
    manifest_sent: &mut bool,
) -> Result<(), TransferError> {
    let mut file = File::open(path).await?;
    let file_size = file.metadata().await?.len();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(sanitize_file_name)
        .ok_or_else(|| TransferError::Config(format!("{} has no file name", path.display())))?;

    let mut chunks = plan_chunks(file_size, options.chunk_size).map_err(|e| match e {
        ChunkError::ZeroChunkSize => TransferError::Config(e.to_string()),
        other => TransferError::Protocol(other.to_string()),
    })?;
    for chunk in &mut chunks {
        chunk.checksum = hash_range(&mut file, chunk.offset, chunk.size).await?;
    }

    info.file_id = generate_file_id(path);
    info.file_name = file_name.clone();
    info.file_size = file_size;
    info.chunk_size = options.chunk_size;
    info.total_chunks = chunks.len() as u32;
    info.chunks = chunks.clone();
    progress.report(info, true);

    let manifest = Manifest {
        file_id: info.file_id.clone(),
        file_name,
        file_size,
        chunk_size: options.chunk_size,
        chunks,
    };
    let file_id = manifest.file_id.clone();
    let mut inbox = link.open_transfer(&file_id)?;
    link.send_transfer(TransferControl::Manifest(manifest))?;
    *manifest_sent = true;
    debug!(peer = %link.peer_id(), %file_id, chunks = info.total_chunks, "manifest sent");

    let have = loop {
        match next_control(&mut inbox, options.ack_timeout, "manifest ack").await? {
            TransferControl::ManifestAck { have, .. } => break have,
            TransferControl::Abort { reason, .. } => return Err(TransferError::Aborted(reason)),
            other => debug!(?other, "ignoring control before manifest ack"),
        }
    };

    let mut ledger = ChunkLedger::new(info.total_chunks);
    for index in have {
        info.mark_completed(&mut ledger, index);
    }
    if ledger.completed_count() > 0 {
        info!(peer = %link.peer_id(), resumed = ledger.completed_count(), "peer already has chunks");
    }
    info.status = TransferStatus::Transferring;
    progress.report(info, true);

    let mut queue: VecDeque<u32> = ledger.pending().collect();
    let mut attempts: Vec<u32> = vec![0; info.total_chunks as usize];
    let mut in_flight: HashMap<u32, tokio::time::Instant> = HashMap::new();
    let mut retry_at: Vec<(tokio::time::Instant, u32)> = Vec::new();

    while !ledger.is_complete() {
        while in_flight.len() < options.parallelism {
            let Some(index) = queue.pop_front() else { break };
            if ledger.is_completed(index) {
                continue;
            }
            let chunk = &info.chunks[index as usize];
            let data = read_chunk(&mut file, chunk).await?;
            if options.verify_checksums && !verify_chunk(&data, &chunk.checksum) {
                // The source changed under us.
                return Err(TransferError::ChecksumMismatch { index });
            }
            link.send_chunk(&ChunkFrame {
                file_id: file_id.clone(),
                index,
                offset: chunk.offset,
                data,
            })?;
            attempts[index as usize] += 1;
            in_flight.insert(index, tokio::time::Instant::now() + options.ack_timeout);
        }

        let wake = in_flight
            .values()
            .copied()
            .chain(retry_at.iter().map(|(t, _)| *t))
            .min();
        let Some(wake) = wake else {
            return Err(TransferError::Protocol("no chunks left to send".into()));
        };

        tokio::select! {
            msg = inbox.recv() => {
                let msg = msg.ok_or_else(|| TransportError::PeerNotConnected(link.peer_id().to_string()))?;
                let Inbound::Control(ctl) = msg else { continue };
                match ctl {
                    TransferControl::ChunkAck { index, ok, .. } => {
                        if in_flight.remove(&index).is_none() {
                            continue;
                        }
                        if ok {
                            info.mark_completed(&mut ledger, index);
                            progress.report(info, false);
                        } else {
                            debug!(index, "chunk refused by peer");
                            schedule_retry(index, &attempts, options, &mut retry_at, TransferError::ChecksumMismatch { index })?;
                        }
                    }
                    TransferControl::Abort { reason, .. } => return Err(TransferError::Aborted(reason)),
                    other => debug!(?other, "ignoring control during transfer"),
                }
            }
            _ = tokio::time::sleep_until(wake) => {
                let now = tokio::time::Instant::now();
                let expired: Vec<u32> = in_flight
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(i, _)| *i)
                    .collect();
                for index in expired {
                    in_flight.remove(&index);
                    debug!(index, "chunk ack timed out");
                    schedule_retry(index, &attempts, options, &mut retry_at, TransferError::Timeout(format!("ack of chunk {}", index)))?;
                }
                retry_at.retain(|(t, index)| {
                    if *t <= now {
                        queue.push_back(*index);
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }

    loop {
        match next_control(&mut inbox, options.ack_timeout, "completion").await? {
            TransferControl::Complete { .. } => return Ok(()),
            TransferControl::Abort { reason, .. } => return Err(TransferError::Aborted(reason)),
            _ => continue,
        }
    }
}

fn schedule_retry(
    index: u32,
    attempts: &[u32],
    options: &TransferOptions,
    retry_at: &mut Vec<(tokio::time::Instant, u32)>,
    give_up: TransferError,
) -> Result<(), TransferError> {
    if attempts[index as usize] > options.retry_count {
        return Err(give_up);
    }
    retry_at.push((tokio::time::Instant::now() + options.retry_delay, index));
    Ok(())
}

async fn read_chunk(file: &mut File, chunk: &ChunkInfo) -> Result<Vec<u8>, TransferError> {
    file.seek(SeekFrom::Start(chunk.offset)).await?;
    let mut data = vec![0u8; chunk.size as usize];
    file.read_exact(&mut data).await?;
    Ok(data)
}

/// Next transfer control on `inbox`, skipping chunks.
async fn next_control(
    inbox: &mut TransferStream,
    timeout: Duration,
    what: &str,
) -> Result<TransferControl, TransferError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let msg = tokio::time::timeout_at(deadline, inbox.recv())
            .await
            .map_err(|_| TransferError::Timeout(what.to_string()))?
            .ok_or_else(|| TransferError::Protocol(format!("link closed waiting for {}", what)))?;
        match msg {
            Inbound::Control(ctl) => return Ok(ctl),
            Inbound::Chunk(_) => continue,
        }
    }
}

async fn drive_receive(
    link: &PeerLink,
    dest_dir: &Path,
    options: &TransferOptions,
    info: &mut FileTransferInfo,
    progress: &mut Progress,
    manifest_seen: &mut bool,
) -> Result<(), TransferError> {
    let incoming = tokio::time::timeout(options.offer_timeout, link.accept_transfer())
        .await
        .map_err(|_| TransferError::Timeout("manifest".into()))?
        .ok_or_else(|| TransferError::Protocol("link closed waiting for manifest".into()))?;
    let manifest = incoming.manifest;
    let mut inbox = incoming.stream;
    info.file_id = manifest.file_id.clone();
    *manifest_seen = true;
    manifest
        .validate()
        .map_err(|e| TransferError::Protocol(format!("bad manifest: {}", e)))?;
    let file_name = sanitize_file_name(&manifest.file_name)
        .ok_or_else(|| TransferError::Protocol(format!("bad file name {:?}", manifest.file_name)))?;

    tokio::fs::create_dir_all(dest_dir).await?;
    let final_path = dest_dir.join(&file_name);
    let part_path = dest_dir.join(format!("{}{}", file_name, PART_SUFFIX));

    info.file_name = file_name;
    info.file_path = final_path.clone();
    info.file_size = manifest.file_size;
    info.chunk_size = manifest.chunk_size;
    info.total_chunks = manifest.chunks.len() as u32;
    info.chunks = manifest.chunks.clone();
    progress.report(info, true);

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&part_path)
        .await?;
    let mut ledger = ChunkLedger::new(info.total_chunks);
    let existing = file.metadata().await?.len();
    if existing == manifest.file_size && manifest.file_size > 0 {
        for chunk in &manifest.chunks {
            let on_disk = hash_range(&mut file, chunk.offset, chunk.size).await?;
            if on_disk.eq_ignore_ascii_case(&chunk.checksum) {
                info.mark_completed(&mut ledger, chunk.index);
            }
        }
        if ledger.completed_count() > 0 {
            info!(file = %info.file_name, have = ledger.completed_count(), "resuming partial download");
        }
    } else {
        file.set_len(0).await?;
        file.set_len(manifest.file_size).await?;
    }

    let have: Vec<u32> = (0..info.total_chunks).filter(|i| ledger.is_completed(*i)).collect();
    link.send_transfer(TransferControl::ManifestAck {
        file_id: manifest.file_id.clone(),
        have,
    })?;
    info.status = TransferStatus::Receiving;
    progress.report(info, true);

    let mut failures: Vec<u32> = vec![0; info.total_chunks as usize];
    let chunk_wait = options.chunk_wait();
    while !ledger.is_complete() {
        let msg = tokio::time::timeout(chunk_wait, inbox.recv())
            .await
            .map_err(|_| TransferError::Timeout("next chunk".into()))?
            .ok_or_else(|| TransportError::PeerNotConnected(link.peer_id().to_string()))?;
        let frame = match msg {
            Inbound::Chunk(frame) => frame,
            Inbound::Control(TransferControl::Abort { reason, .. }) => {
                return Err(TransferError::Aborted(reason));
            }
            _ => continue,
        };
        let index = frame.index;
        let Some(chunk) = manifest.chunk(index) else {
            warn!(index, "chunk index out of range");
            continue;
        };
        let ack = |ok: bool| {
            link.send_transfer(TransferControl::ChunkAck {
                file_id: manifest.file_id.clone(),
                index,
                ok,
            })
        };
        if ledger.is_completed(index) {
            ack(true)?;
            continue;
        }
        let well_formed = frame.offset == chunk.offset && frame.data.len() as u64 == chunk.size;
        let intact = !options.verify_checksums || verify_chunk(&frame.data, &chunk.checksum);
        if !(well_formed && intact) {
            failures[index as usize] += 1;
            if failures[index as usize] > options.retry_count {
                return Err(TransferError::ChecksumMismatch { index });
            }
            debug!(index, attempt = failures[index as usize], "chunk rejected");
            ack(false)?;
            continue;
        }
        file.seek(SeekFrom::Start(chunk.offset)).await?;
        file.write_all(&frame.data).await?;
        info.mark_completed(&mut ledger, index);
        ack(true)?;
        progress.report(info, false);
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&part_path, &final_path).await?;
    link.send_transfer(TransferControl::Complete {
        file_id: manifest.file_id.clone(),
    })?;
    Ok(())
}

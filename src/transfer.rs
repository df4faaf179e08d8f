//! File transfers over a connected session.
//!
//! Transfers run on the session's file subsystem (SFTP over SSH), recurse into
//! directories and are gated by the downloads/uploads pools of the session's
//! context. A transfer that breaks half way is not an error for the caller:
//! it is logged and reported as [`TransferStatus::Partial`] or
//! [`TransferStatus::Failed`] together with the files it got to.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::{SessionError, TransportError};
use crate::session::{FileRequest, RemoteEntry, RemoteFs, Session};

const CHUNK_SIZE: usize = 64 * 1024;
/// Longest period without a speed update while a file is in flight.
const SPEED_INTERVAL: Duration = Duration::from_secs(10);

/// Called after every chunk with `(file, bytes_done, bytes_total)`.
pub type Progress = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

/// Outcome of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Complete,
    /// Failed after at least one file was transferred.
    Partial,
    /// Failed before any file was transferred.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub status: TransferStatus,
    /// Destination paths written to, in transfer order, including a file
    /// interrupted half way.
    pub files: Vec<String>,
    /// Payload bytes moved.
    pub bytes: u64,
    /// Why the transfer stopped, unless complete.
    pub error: Option<String>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.status == TransferStatus::Complete
    }
}

/// Transfer speed of one file in bytes per second.
///
/// Reports the average over the whole file on completion, and otherwise the
/// rate since the last report once more than ten seconds have passed.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    started: Instant,
    last_report: Instant,
    last_received: u64,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(now: Instant) -> Self {
        Self {
            started: now,
            last_report: now,
            last_received: 0,
        }
    }

    /// New speed, if one is due.
    pub fn update(&mut self, received: u64, total: u64) -> Option<f64> {
        self.update_at(Instant::now(), received, total)
    }

    fn update_at(&mut self, now: Instant, received: u64, total: u64) -> Option<f64> {
        if received == total {
            let speed = rate(received, now - self.started);
            *self = Self::starting_at(now);
            return Some(speed);
        }
        let elapsed = now - self.last_report;
        if elapsed > SPEED_INTERVAL {
            let speed = rate(received.saturating_sub(self.last_received), elapsed);
            self.last_report = now;
            self.last_received = received;
            return Some(speed);
        }
        None
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    // Sub-millisecond transfers would otherwise report infinite speed.
    bytes as f64 / elapsed.as_secs_f64().max(0.001)
}

fn remote_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn remote_join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Uploads and downloads files of one session.
#[derive(Debug, Clone)]
pub struct TransferManager {
    session: Session,
}

impl TransferManager {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Copies the remote file or directory `remote` to `local`.
    ///
    /// When `local` is an existing directory the remote base name is appended.
    pub async fn download(
        &self,
        remote: &str,
        local: impl AsRef<Path>,
        progress: Option<Progress>,
    ) -> Result<TransferReport, SessionError> {
        let transport = self.session.transport()?;
        let _slot = self.session.context().pools.downloads.acquire().await;

        let mut local = local.as_ref().to_path_buf();
        if tokio::fs::metadata(&local)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
        {
            local.push(remote_basename(remote));
        }

        let mut copier = Copier::new(&self.session, "download", progress);
        let result = async {
            let fs = transport.open_fs().await?;
            let entry = fs.stat(remote).await?;
            copier
                .download_tree(fs.as_ref(), entry, remote.to_string(), local.clone())
                .await
        }
        .await;
        Ok(copier.finish(remote, &local.display().to_string(), result))
    }

    /// Copies the local file or directory `local` to `remote`.
    ///
    /// When `remote` is an existing directory the local base name is appended.
    pub async fn upload(
        &self,
        local: impl AsRef<Path>,
        remote: &str,
        progress: Option<Progress>,
    ) -> Result<TransferReport, SessionError> {
        let transport = self.session.transport()?;
        let _slot = self.session.context().pools.uploads.acquire().await;
        let local = local.as_ref();

        let mut copier = Copier::new(&self.session, "upload", progress);
        let mut destination = remote.to_string();
        let result = async {
            let fs = transport.open_fs().await?;
            if let Ok(entry) = fs.stat(remote).await
                && entry.is_dir
                && let Some(name) = local.file_name()
            {
                destination = remote_join(remote, &name.to_string_lossy());
            }
            copier
                .upload_tree(fs.as_ref(), local.to_path_buf(), destination.clone())
                .await
        }
        .await;
        Ok(copier.finish(&local.display().to_string(), &destination, result))
    }
}

/// State of one running transfer.
struct Copier<'a> {
    session: &'a Session,
    direction: &'static str,
    progress: Option<Progress>,
    files: Vec<String>,
    completed: usize,
    bytes: u64,
}

impl<'a> Copier<'a> {
    fn new(session: &'a Session, direction: &'static str, progress: Option<Progress>) -> Self {
        Self {
            session,
            direction,
            progress,
            files: Vec::new(),
            completed: 0,
            bytes: 0,
        }
    }

    fn download_tree<'s>(
        &'s mut self,
        fs: &'s dyn RemoteFs,
        entry: RemoteEntry,
        remote: String,
        local: PathBuf,
    ) -> BoxFuture<'s, Result<(), TransportError>> {
        Box::pin(async move {
            if !entry.is_dir {
                return self.download_file(fs, &remote, entry.size, &local).await;
            }
            tokio::fs::create_dir_all(&local).await?;
            let mut children = fs.read_dir(&remote).await?;
            children.sort_by(|a, b| a.name.cmp(&b.name));
            for child in children {
                let child_remote = remote_join(&remote, &child.name);
                let child_local = local.join(&child.name);
                self.download_tree(fs, child, child_remote, child_local)
                    .await?;
            }
            Ok(())
        })
    }

    async fn download_file(
        &mut self,
        fs: &dyn RemoteFs,
        remote: &str,
        size: u64,
        local: &Path,
    ) -> Result<(), TransportError> {
        let request = self.session.track_file(remote);
        let mut reader = fs.open_read(remote).await?;
        let mut writer = tokio::fs::File::create(local).await?;
        self.files.push(local.display().to_string());
        self.copy(&request, &mut reader, &mut writer, size).await
    }

    fn upload_tree<'s>(
        &'s mut self,
        fs: &'s dyn RemoteFs,
        local: PathBuf,
        remote: String,
    ) -> BoxFuture<'s, Result<(), TransportError>> {
        Box::pin(async move {
            let metadata = tokio::fs::metadata(&local).await?;
            if !metadata.is_dir() {
                return self.upload_file(fs, &local, metadata.len(), &remote).await;
            }
            fs.create_dir(&remote).await?;
            let mut entries = tokio::fs::read_dir(&local).await?;
            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                names.push(entry.file_name());
            }
            names.sort();
            for name in names {
                let child_remote = remote_join(&remote, &name.to_string_lossy());
                self.upload_tree(fs, local.join(&name), child_remote).await?;
            }
            Ok(())
        })
    }

    async fn upload_file(
        &mut self,
        fs: &dyn RemoteFs,
        local: &Path,
        size: u64,
        remote: &str,
    ) -> Result<(), TransportError> {
        let request = self.session.track_file(&local.display().to_string());
        let mut reader = tokio::fs::File::open(local).await?;
        let mut writer = fs.open_write(remote).await?;
        self.files.push(remote.to_string());
        self.copy(&request, &mut reader, &mut writer, size).await
    }

    async fn copy<R, W>(
        &mut self,
        request: &FileRequest,
        reader: &mut R,
        writer: &mut W,
        total: u64,
    ) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let file = request.file_name();
        let mut meter = SpeedMeter::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        request.update(0, total);

        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read]).await?;
            received += read as u64;
            self.bytes += read as u64;

            let total = total.max(received);
            request.update(received, total);
            if let Some(progress) = &self.progress {
                progress(file, received, total);
            }
            if received < total
                && let Some(speed) = meter.update(received, total)
            {
                request.set_speed(speed);
                info!("{}: {}ing `{file}`: {request}", self.session, self.direction);
            }
        }
        writer.shutdown().await?;

        request.update(received, received);
        if received == 0
            && let Some(progress) = &self.progress
        {
            progress(file, 0, 0);
        }
        if let Some(speed) = meter.update(received, received) {
            request.set_speed(speed);
        }
        info!("{}: {} `{file}`: {request}", self.session, self.direction);
        self.completed += 1;
        Ok(())
    }

    fn finish(
        self,
        source: &str,
        destination: &str,
        result: Result<(), TransportError>,
    ) -> TransferReport {
        let (status, error) = match result {
            Ok(()) => {
                info!(
                    "{}: {} `{source}` --> `{destination}`: DONE",
                    self.session, self.direction
                );
                (TransferStatus::Complete, None)
            }
            Err(err) => {
                error!(
                    "{}: {} `{source}` --> `{destination}`: {err}",
                    self.session, self.direction
                );
                let status = if self.completed > 0 {
                    TransferStatus::Partial
                } else {
                    TransferStatus::Failed
                };
                (status, Some(err.to_string()))
            }
        };
        debug!(
            "{}: {} moved {} bytes in {} file(s)",
            self.session, self.direction, self.bytes, self.completed
        );
        TransferReport {
            status,
            files: self.files,
            bytes: self.bytes,
            error,
        }
    }
}

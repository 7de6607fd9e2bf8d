//! Disk transfers over the HTTP data-plane.
//!
//! One transfer moves one disk image. A management task is created to track
//! it, the HTTP stream runs on its own tokio task, and the caller polls the
//! management task until it leaves `pending`, reports progress above the
//! ceiling, or the stream fails. Both sides are joined before returning, so
//! disks are processed one after another.

pub mod progress;
pub mod progress_stream;

use crate::utils::errors::{BackupError, Result};
use crate::xapi::{normalize_host, OpaqueRef, TaskStatus, XenApi};
use futures_util::StreamExt;
use progress::{
    format_bytes, format_duration, format_fraction, format_speed, ProgressTracker, TransferStats,
};
use progress_stream::ProgressStream;
use reqwest::Url;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PROGRESS_CEILING: f64 = 0.95;

/// Image format requested from the data-plane.
const IMAGE_FORMAT: &str = "vhd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Hypervisor to local file (GET)
    Export,
    /// Local file to hypervisor (PUT)
    Import,
}

impl Direction {
    pub fn path(&self) -> &'static str {
        match self {
            Direction::Export => "export_raw_vdi",
            Direction::Import => "import_raw_vdi",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Export => f.write_str("export"),
            Direction::Import => f.write_str("import"),
        }
    }
}

/// Why the poll loop stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollExit {
    /// Task left `pending`
    Finished(TaskStatus),
    /// Task still pending but reported progress above the ceiling
    ProgressCeiling(f64),
    /// The HTTP stream failed; its error is reported instead
    StreamFailed,
}

/// One disk transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: Direction,
    /// Data-plane base URL or bare address
    pub endpoint: String,
    pub vdi: OpaqueRef,
    /// Export only: emit the delta against this image
    pub base: Option<OpaqueRef>,
    pub local_file: PathBuf,
}

impl TransferRequest {
    pub fn export(
        endpoint: impl Into<String>,
        vdi: OpaqueRef,
        base: Option<OpaqueRef>,
        local_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            direction: Direction::Export,
            endpoint: endpoint.into(),
            vdi,
            base,
            local_file: local_file.into(),
        }
    }

    pub fn import(endpoint: impl Into<String>, vdi: OpaqueRef, local_file: impl Into<PathBuf>) -> Self {
        Self {
            direction: Direction::Import,
            endpoint: endpoint.into(),
            vdi,
            base: None,
            local_file: local_file.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub direction: Direction,
    pub local_file: PathBuf,
    pub bytes: u64,
    pub elapsed: Duration,
    pub poll_exit: PollExit,
}

/// Build a data-plane URL. The session id is embedded, so never log it.
pub fn build_url(
    endpoint: &str,
    direction: Direction,
    session_id: &str,
    task: &OpaqueRef,
    vdi: &OpaqueRef,
    base: Option<&OpaqueRef>,
) -> Result<Url> {
    let root = normalize_host(endpoint, "http");
    let mut url = Url::parse(&format!("{}/{}", root, direction.path()))
        .map_err(|e| BackupError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("session_id", session_id)
            .append_pair("task_id", task.as_str())
            .append_pair("vdi", vdi.as_str())
            .append_pair("format", IMAGE_FORMAT);
        if let (Direction::Export, Some(base)) = (direction, base) {
            query.append_pair("base", base.as_str());
        }
    }

    Ok(url)
}

/// Runs transfers against the data-plane.
#[derive(Clone)]
pub struct TransferEngine {
    client: reqwest::Client,
    poll_interval: Duration,
    progress_ceiling: f64,
}

impl TransferEngine {
    pub fn new(insecure_tls: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_tls)
            .build()?;

        Ok(Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            progress_ceiling: DEFAULT_PROGRESS_CEILING,
        })
    }

    pub fn with_polling(mut self, poll_interval: Duration, progress_ceiling: f64) -> Self {
        self.poll_interval = poll_interval;
        self.progress_ceiling = progress_ceiling;
        self
    }

    /// Move one disk image and wait for both the stream and the task.
    pub async fn transfer(&self, api: &dyn XenApi, request: &TransferRequest) -> Result<TransferOutcome> {
        // Uploads know their size up front
        let total_bytes = match request.direction {
            Direction::Import => Some(tokio::fs::metadata(&request.local_file).await?.len()),
            Direction::Export => None,
        };

        let label = format!("{} {}", request.direction.path(), request.vdi);
        let task = api.task_create(&label, &request.local_file.display().to_string()).await?;
        let url = build_url(
            &request.endpoint,
            request.direction,
            api.session_id(),
            &task,
            &request.vdi,
            request.base.as_ref(),
        )?;

        info!(
            "Starting {} of {} ({}){}",
            request.direction,
            request.vdi,
            request.local_file.display(),
            request
                .base
                .as_ref()
                .map(|b| format!(" against base {}", b))
                .unwrap_or_default()
        );

        let started = Instant::now();
        let counter = Arc::new(AtomicU64::new(0));
        let stream_failed = CancellationToken::new();

        let handle = {
            let client = self.client.clone();
            let direction = request.direction;
            let path = request.local_file.clone();
            let counter = Arc::clone(&counter);
            let stream_failed = stream_failed.clone();
            tokio::spawn(async move {
                let result = match direction {
                    Direction::Export => download(&client, url, &path, counter).await,
                    Direction::Import => upload(&client, url, &path, counter).await,
                };
                if result.is_err() {
                    stream_failed.cancel();
                }
                result
            })
        };

        let polled = self
            .poll_task(api, &task, &request.vdi, &stream_failed, &counter, total_bytes)
            .await;
        if polled.is_err() {
            handle.abort();
        }

        let streamed = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(BackupError::Transfer(format!(
                "{} stream aborted",
                request.direction
            ))),
            Err(e) => Err(BackupError::Transfer(format!(
                "{} stream panicked: {}",
                request.direction, e
            ))),
        };

        if let Err(e) = api.task_destroy(&task).await {
            warn!("Failed to destroy task {}: {}", task, e);
        }

        // Poll errors abort the stream, so they take precedence
        let exit = polled?;
        let bytes = streamed?;
        ensure_task_ok(&task, exit)?;

        let elapsed = started.elapsed();
        info!(
            "Finished {} of {}: {} in {}",
            request.direction,
            request.vdi,
            format_bytes(bytes),
            format_duration(elapsed)
        );

        Ok(TransferOutcome {
            direction: request.direction,
            local_file: request.local_file.clone(),
            bytes,
            elapsed,
            poll_exit: exit,
        })
    }

    /// Poll `task` until it leaves `pending`, crosses the progress ceiling,
    /// or `stream_failed` fires.
    pub async fn poll_task(
        &self,
        api: &dyn XenApi,
        task: &OpaqueRef,
        vdi: &OpaqueRef,
        stream_failed: &CancellationToken,
        counter: &AtomicU64,
        total_bytes: Option<u64>,
    ) -> Result<PollExit> {
        let mut tracker = ProgressTracker::new(total_bytes);

        loop {
            let status = api.task_get_status(task).await?;
            if status != TaskStatus::Pending {
                debug!("Task {} finished with status {}", task, status);
                return Ok(PollExit::Finished(status));
            }

            let progress = api.task_get_progress(task).await?;
            let stats = tracker.update(counter.load(Ordering::Relaxed));
            info!("{}", progress_line(vdi, progress, stats));

            // Some backends never report 1.0 before the task completes
            if progress > self.progress_ceiling {
                debug!("Task {} past progress ceiling ({})", task, progress);
                return Ok(PollExit::ProgressCeiling(progress));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = stream_failed.cancelled() => return Ok(PollExit::StreamFailed),
            }
        }
    }
}

/// One poll sample: the task's own fraction, then what the stream moved.
fn progress_line(vdi: &OpaqueRef, fraction: f64, stats: &TransferStats) -> String {
    let moved = match (stats.total_bytes, stats.percent()) {
        (Some(total), Some(percent)) => format!(
            "{} of {}, {:.1}%",
            format_bytes(stats.transferred_bytes),
            format_bytes(total),
            percent
        ),
        _ => format_bytes(stats.transferred_bytes),
    };
    format!(
        "{}: {} ({} at {})",
        vdi,
        format_fraction(fraction),
        moved,
        format_speed(stats.bytes_per_second)
    )
}

/// A task that ended in failure or cancellation fails the transfer even when
/// the stream itself completed.
pub fn ensure_task_ok(task: &OpaqueRef, exit: PollExit) -> Result<()> {
    match exit {
        PollExit::Finished(status @ (TaskStatus::Failure | TaskStatus::Cancelled | TaskStatus::Cancelling)) => {
            Err(BackupError::TaskFailed {
                task: task.to_string(),
                status: status.to_string(),
            })
        }
        _ => Ok(()),
    }
}

async fn download(client: &reqwest::Client, url: Url, path: &Path, counter: Arc<AtomicU64>) -> Result<u64> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackupError::Transfer(format!(
            "export returned {}: {}",
            status,
            body.trim()
        )));
    }

    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = ProgressStream::new(Box::pin(response.bytes_stream()), counter);
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;

    Ok(stream.bytes_transferred())
}

async fn upload(client: &reqwest::Client, url: Url, path: &Path, counter: Arc<AtomicU64>) -> Result<u64> {
    let file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();

    let stream = ProgressStream::new(ReaderStream::new(file), Arc::clone(&counter));
    let body = reqwest::Body::wrap_stream(stream);

    let response = client
        .put(url)
        .header(reqwest::header::CONTENT_LENGTH, size)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackupError::Transfer(format!(
            "import returned {}: {}",
            status,
            body.trim()
        )));
    }

    Ok(counter.load(Ordering::Relaxed))
}

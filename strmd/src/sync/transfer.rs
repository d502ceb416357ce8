use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use strm_core::{DriveApi, DriveError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::SyncConfig;
use crate::sync::summary::{REASON_FORBIDDEN, REASON_RATE_LIMITED, SyncSummary};

const REASON_DOWNLOAD_FAILED: &str = "download failed";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("drive error: {0}")]
    Drive(#[from] DriveError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("download returned {0}")]
    Status(StatusCode),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    pub fn is_forbidden(&self) -> bool {
        match self {
            TransferError::Drive(err) => err.is_forbidden(),
            TransferError::Status(status) => *status == StatusCode::FORBIDDEN,
            _ => false,
        }
    }
}

/// A small file fetched in full next to the placeholders, e.g. subtitles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarJob {
    pub pickcode: String,
    pub remote_path: String,
    pub target: PathBuf,
}

/// Opens after `threshold` consecutive forbidden responses and stays open
/// for the rest of the run.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive: AtomicU32,
    open: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: AtomicU32::new(0),
            open: AtomicBool::new(false),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn record_forbidden(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.threshold && !self.open.swap(true, Ordering::SeqCst) {
            tracing::warn!(count, "repeated forbidden responses, skipping remaining downloads");
        }
        self.is_open()
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }
}

enum JobResult {
    Downloaded,
    Present,
    ShortCircuited,
    Failed(TransferError),
}

pub struct SidecarDownloader {
    http: Client,
    drive: Arc<dyn DriveApi>,
    concurrency: usize,
    trip_count: u32,
    user_agent: String,
}

impl SidecarDownloader {
    pub fn new(drive: Arc<dyn DriveApi>, config: &SyncConfig) -> Self {
        Self {
            http: Client::new(),
            drive,
            concurrency: config.download_concurrency.max(1),
            trip_count: config.forbidden_trip_count,
            user_agent: concat!("strmd/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// Downloads every job with bounded concurrency. The circuit breaker is
    /// scoped to this call.
    pub async fn download_all(&self, jobs: Vec<SidecarJob>) -> SyncSummary {
        let breaker = CircuitBreaker::new(self.trip_count);
        let results: Vec<JobResult> = futures_util::stream::iter(jobs)
            .map(|job| {
                let breaker = &breaker;
                async move { self.run_job(&job, breaker).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = SyncSummary::default();
        for result in results {
            match result {
                JobResult::Downloaded => summary.downloaded += 1,
                JobResult::Present => summary.unchanged += 1,
                JobResult::ShortCircuited => summary.fail(REASON_RATE_LIMITED),
                JobResult::Failed(err) if err.is_forbidden() => summary.fail(REASON_FORBIDDEN),
                JobResult::Failed(_) => summary.fail(REASON_DOWNLOAD_FAILED),
            }
        }
        summary
    }

    async fn run_job(&self, job: &SidecarJob, breaker: &CircuitBreaker) -> JobResult {
        if breaker.is_open() {
            return JobResult::ShortCircuited;
        }
        if tokio::fs::try_exists(&job.target).await.unwrap_or(false) {
            return JobResult::Present;
        }
        match self.fetch(job).await {
            Ok(()) => {
                breaker.record_success();
                tracing::debug!(path = %job.target.display(), "sidecar downloaded");
                JobResult::Downloaded
            }
            Err(err) => {
                if err.is_forbidden() {
                    breaker.record_forbidden();
                }
                tracing::warn!(path = %job.remote_path, error = %err, "sidecar download failed");
                JobResult::Failed(err)
            }
        }
    }

    async fn fetch(&self, job: &SidecarJob) -> Result<(), TransferError> {
        let link = self
            .drive
            .download_url(&job.pickcode, &self.user_agent)
            .await?;
        let response = self
            .http
            .get(link.url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status(status));
        }

        if let Some(parent) = job.target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&job.target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(partial, &job.target).await?;
        Ok(())
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

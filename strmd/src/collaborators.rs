//! Outside systems the mirror talks to: metadata scraping, notifications,
//! the media server, and the pending-transfer pipeline. Each has a no-op
//! implementation so the daemon runs without any of them configured.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use strm_core::RemoteEntry;
use thiserror::Error;

use crate::sync::life::TransferTicket;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("operation not supported")]
    Unsupported,
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, path: &Path) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, text: &str) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Targeted refresh. Servers that cannot do this return
    /// [`CollaboratorError::Unsupported`].
    async fn refresh(&self, paths: &[PathBuf]) -> Result<(), CollaboratorError>;

    async fn refresh_all(&self) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait TransferHistory: Send + Sync {
    /// Drops history and download-task records below `remote_path`.
    async fn purge_under(&self, remote_path: &str) -> Result<u64, CollaboratorError>;
}

/// Organizes files that land below a transfer root. The pipeline reports
/// back through the [`TransferTicket`] once the file has its final name.
#[async_trait]
pub trait TransferPipeline: Send + Sync {
    async fn enqueue(
        &self,
        entry: &RemoteEntry,
        remote_path: &str,
        ticket: TransferTicket,
    ) -> Result<(), CollaboratorError>;
}

pub trait TransferActivity: Send + Sync {
    fn is_busy(&self) -> bool;
}

/// Targeted refresh first, whole library when that is unsupported.
pub async fn refresh_media(
    server: &dyn MediaServer,
    paths: &[PathBuf],
) -> Result<(), CollaboratorError> {
    match server.refresh(paths).await {
        Err(CollaboratorError::Unsupported) => {
            tracing::debug!("targeted refresh unsupported, refreshing whole library");
            server.refresh_all().await
        }
        other => other,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

#[async_trait]
impl Scraper for Noop {
    async fn scrape(&self, _path: &Path) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Notifications go to the log when no other sink is configured.
#[async_trait]
impl Notifier for Noop {
    async fn notify(&self, title: &str, text: &str) -> Result<(), CollaboratorError> {
        tracing::info!(title, text, "notification");
        Ok(())
    }
}

#[async_trait]
impl MediaServer for Noop {
    async fn refresh(&self, _paths: &[PathBuf]) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn refresh_all(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[async_trait]
impl TransferHistory for Noop {
    async fn purge_under(&self, _remote_path: &str) -> Result<u64, CollaboratorError> {
        Ok(0)
    }
}

#[async_trait]
impl TransferPipeline for Noop {
    async fn enqueue(
        &self,
        _entry: &RemoteEntry,
        remote_path: &str,
        ticket: TransferTicket,
    ) -> Result<(), CollaboratorError> {
        tracing::debug!(path = remote_path, "no transfer pipeline configured");
        ticket.abandon();
        Ok(())
    }
}

impl TransferActivity for Noop {
    fn is_busy(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub scraper: Arc<dyn Scraper>,
    pub notifier: Arc<dyn Notifier>,
    pub media_server: Arc<dyn MediaServer>,
    pub history: Arc<dyn TransferHistory>,
    pub pipeline: Arc<dyn TransferPipeline>,
    pub activity: Arc<dyn TransferActivity>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            scraper: Arc::new(Noop),
            notifier: Arc::new(Noop),
            media_server: Arc::new(Noop),
            history: Arc::new(Noop),
            pipeline: Arc::new(Noop),
            activity: Arc::new(Noop),
        }
    }
}

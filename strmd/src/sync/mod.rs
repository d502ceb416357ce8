pub mod backoff;
pub mod full;
pub mod generate;
pub mod id_cache;
pub mod incremental;
pub mod index;
pub mod life;
pub mod placeholder;
pub mod prune;
pub mod summary;
pub mod transfer;
pub mod tree_diff;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use strm_core::{DriveError, RemoteId};
use thiserror::Error;

use crate::config::SyncRootMapping;
use crate::sync::index::IndexError;
use crate::sync::placeholder::PlaceholderError;
use crate::sync::tree_diff::DiffError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("drive error: {0}")]
    Drive(#[from] DriveError),
    #[error("snapshot error: {0}")]
    Diff(#[from] DiffError),
    #[error("placeholder error: {0}")]
    Placeholder(#[from] PlaceholderError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote root not found: {0}")]
    RootNotFound(String),
    #[error("no mapping covers remote path {0}")]
    Unmapped(String),
    #[error("ancestor walk stalled at {ancestor} (id {id}) while resolving {target}")]
    AncestorStalled {
        target: String,
        ancestor: String,
        id: RemoteId,
    },
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Fresh scratch directory for one run's snapshot files.
pub(crate) async fn run_dir(
    work_dir: &Path,
    kind: &str,
    mapping: &SyncRootMapping,
) -> Result<PathBuf, SyncError> {
    let label: String = mapping
        .local_root
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: u32 = rand::random();
    let dir = work_dir.join(format!("{kind}{label}-{stamp}-{suffix:08x}"));
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

pub(crate) async fn discard_run_dir(dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await {
        tracing::debug!(path = %dir.display(), error = %err, "could not remove run directory");
    }
}

pub(crate) fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

pub(crate) fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

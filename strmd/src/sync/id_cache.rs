use std::sync::Arc;

use moka::sync::Cache;
use strm_core::{DriveApi, ROOT_ID, RemoteId};

use crate::sync::SyncError;
use crate::sync::index::{IndexRow, PathIndex};

/// Bounded id <-> path lookups in front of [`PathIndex`] and the drive.
///
/// The cache is never authoritative: misses fall through to the index and
/// then to the remote, and remote hits are written back to the index.
pub struct IdPathCache {
    by_id: Cache<RemoteId, String>,
    by_path: Cache<String, RemoteId>,
    index: Arc<PathIndex>,
    drive: Arc<dyn DriveApi>,
}

impl IdPathCache {
    pub fn new(capacity: u64, index: Arc<PathIndex>, drive: Arc<dyn DriveApi>) -> Self {
        Self {
            by_id: Cache::builder().max_capacity(capacity).build(),
            by_path: Cache::builder().max_capacity(capacity).build(),
            index,
            drive,
        }
    }

    pub fn add(&self, id: RemoteId, path: &str) {
        let path = normalize_key(path);
        self.by_id.insert(id, path.clone());
        self.by_path.insert(path, id);
    }

    pub async fn get_by_id(&self, id: RemoteId) -> Result<Option<String>, SyncError> {
        if id == ROOT_ID {
            return Ok(Some("/".to_string()));
        }
        if let Some(path) = self.by_id.get(&id) {
            return Ok(Some(path));
        }
        if let Some(row) = self.index.get_by_id(id).await? {
            self.add(id, &row.path);
            return Ok(Some(row.path));
        }

        let Some(walked) = self.drive.get_entry(id).await? else {
            return Ok(None);
        };
        let row = IndexRow::from_walked(&walked);
        self.index.upsert_batch(std::slice::from_ref(&row)).await?;
        self.add(id, &row.path);
        Ok(Some(row.path))
    }

    /// Id of the folder at `path`, falling back to the remote on a miss.
    pub async fn get_by_dir(&self, path: &str) -> Result<Option<RemoteId>, SyncError> {
        if let Some(id) = self.peek_dir(path).await? {
            return Ok(Some(id));
        }
        let key = normalize_key(path);
        let Some(id) = self.drive.resolve_path(&key).await? else {
            return Ok(None);
        };
        if let Some(walked) = self.drive.get_entry(id).await? {
            self.index
                .upsert_batch(&[IndexRow::from_walked(&walked)])
                .await?;
        }
        self.add(id, &key);
        Ok(Some(id))
    }

    /// Cache and index only; never calls the drive.
    pub async fn peek_dir(&self, path: &str) -> Result<Option<RemoteId>, SyncError> {
        let key = normalize_key(path);
        if key == "/" {
            return Ok(Some(ROOT_ID));
        }
        if let Some(id) = self.by_path.get(&key) {
            return Ok(Some(id));
        }
        match self.index.get_by_path_healing(&key).await? {
            Some(row) if row.is_dir() => {
                self.add(row.id, &key);
                Ok(Some(row.id))
            }
            _ => Ok(None),
        }
    }

    pub fn remove_path(&self, path: &str) {
        let key = normalize_key(path);
        if let Some(id) = self.by_path.remove(&key) {
            self.by_id.invalidate(&id);
        }
    }

    pub fn remove_id(&self, id: RemoteId) {
        if let Some(path) = self.by_id.remove(&id) {
            self.by_path.invalidate(&path);
        }
    }

    pub fn clear(&self) {
        self.by_id.invalidate_all();
        self.by_path.invalidate_all();
    }

    pub fn index(&self) -> &Arc<PathIndex> {
        &self.index
    }
}

fn normalize_key(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

use std::{fs, path::PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use strm_core::{EntryKind, LifeCursor, RemoteEntry, RemoteId, WalkedEntry};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("{count} index rows share path {path}")]
    DuplicatePath { path: String, count: usize },
}

/// Materialized absolute path of one remote item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub id: RemoteId,
    pub parent_id: RemoteId,
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub pickcode: Option<String>,
    pub sha1: Option<String>,
    pub size: Option<i64>,
}

impl IndexRow {
    pub fn from_entry(entry: &RemoteEntry, path: impl Into<String>) -> Self {
        Self {
            id: entry.id,
            parent_id: entry.parent_id,
            name: entry.name.clone(),
            path: path.into(),
            kind: entry.kind,
            pickcode: entry.pickcode.clone(),
            sha1: entry.sha1.clone(),
            size: entry.size.map(|v| v as i64),
        }
    }

    pub fn from_walked(walked: &WalkedEntry) -> Self {
        Self::from_entry(&walked.entry, walked.path())
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn to_entry(&self) -> RemoteEntry {
        RemoteEntry {
            id: self.id,
            parent_id: self.parent_id,
            name: self.name.clone(),
            kind: self.kind,
            size: self.size.map(|v| v.max(0) as u64),
            sha1: self.sha1.clone(),
            pickcode: self.pickcode.clone(),
            created: None,
            modified: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexCounts {
    pub files: i64,
    pub folders: i64,
}

/// Durable id <-> path store. Files and folders live in separate tables, an
/// id appears in at most one of them and a path is held by at most one row.
pub struct PathIndex {
    pool: SqlitePool,
}

impl PathIndex {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: Option<PathBuf>) -> Result<Self, IndexError> {
        let db_path = match db_path {
            Some(path) => path,
            None => default_db_path()?,
        };
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let index = Self { pool };
        index.init().await?;
        Ok(index)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Writes `rows` in one transaction. Any row sharing an id or a path with
    /// an incoming row is removed first, so later rows win.
    pub async fn upsert_batch(&self, rows: &[IndexRow]) -> Result<usize, IndexError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let displaced: Vec<i64> = sqlx::query_scalar(
                "SELECT id FROM files WHERE path = ?1 AND id != ?2
                 UNION ALL
                 SELECT id FROM folders WHERE path = ?1 AND id != ?2",
            )
            .bind(&row.path)
            .bind(row.id)
            .fetch_all(&mut *tx)
            .await?;
            if !displaced.is_empty() {
                tracing::warn!(
                    path = %row.path,
                    id = row.id,
                    ?displaced,
                    "path collision, replacing index rows held by other ids"
                );
            }

            sqlx::query("DELETE FROM files WHERE id = ?1 OR path = ?2")
                .bind(row.id)
                .bind(&row.path)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM folders WHERE id = ?1 OR path = ?2")
                .bind(row.id)
                .bind(&row.path)
                .execute(&mut *tx)
                .await?;

            match row.kind {
                EntryKind::File => {
                    sqlx::query(
                        "INSERT INTO files (id, parent_id, name, path, pickcode, sha1, size)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )
                    .bind(row.id)
                    .bind(row.parent_id)
                    .bind(&row.name)
                    .bind(&row.path)
                    .bind(&row.pickcode)
                    .bind(&row.sha1)
                    .bind(row.size)
                    .execute(&mut *tx)
                    .await?;
                }
                EntryKind::Dir => {
                    sqlx::query(
                        "INSERT INTO folders (id, parent_id, name, path) VALUES (?1, ?2, ?3, ?4)",
                    )
                    .bind(row.id)
                    .bind(row.parent_id)
                    .bind(&row.name)
                    .bind(&row.path)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    pub async fn get_by_id(&self, id: RemoteId) -> Result<Option<IndexRow>, IndexError> {
        let file = sqlx::query(
            "SELECT id, parent_id, name, path, pickcode, sha1, size FROM files WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = file {
            return Ok(Some(file_row(&row)?));
        }

        let folder = sqlx::query("SELECT id, parent_id, name, path FROM folders WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        folder.map(|row| folder_row(&row)).transpose()
    }

    /// Point lookup by path. More than one matching row is reported as
    /// [`IndexError::DuplicatePath`]; see [`PathIndex::get_by_path_healing`].
    pub async fn get_by_path(&self, path: &str) -> Result<Option<IndexRow>, IndexError> {
        let files = sqlx::query(
            "SELECT id, parent_id, name, path, pickcode, sha1, size FROM files WHERE path = ?1",
        )
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        let folders = sqlx::query("SELECT id, parent_id, name, path FROM folders WHERE path = ?1")
            .bind(path)
            .fetch_all(&self.pool)
            .await?;

        let count = files.len() + folders.len();
        if count > 1 {
            return Err(IndexError::DuplicatePath {
                path: path.to_string(),
                count,
            });
        }
        if let Some(row) = files.first() {
            return Ok(Some(file_row(row)?));
        }
        folders.first().map(folder_row).transpose()
    }

    /// [`PathIndex::get_by_path`] that purges duplicate rows and retries once.
    pub async fn get_by_path_healing(&self, path: &str) -> Result<Option<IndexRow>, IndexError> {
        match self.get_by_path(path).await {
            Err(IndexError::DuplicatePath { count, .. }) => {
                tracing::warn!(path, count, "purging duplicate index rows");
                self.purge_path(path).await?;
                self.get_by_path(path).await
            }
            other => other,
        }
    }

    pub async fn purge_path(&self, path: &str) -> Result<u64, IndexError> {
        let files = sqlx::query("DELETE FROM files WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        let folders = sqlx::query("DELETE FROM folders WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(files.rows_affected() + folders.rows_affected())
    }

    /// Removes `path` and everything below it.
    pub async fn remove_by_path_prefix(
        &self,
        path: &str,
        files_only: bool,
    ) -> Result<u64, IndexError> {
        let exact = path.trim_end_matches('/');
        let exact = if exact.is_empty() { "/" } else { exact };
        let prefix = if exact == "/" {
            "/".to_string()
        } else {
            format!("{exact}/")
        };

        let mut tx = self.pool.begin().await?;
        let files = sqlx::query(
            "DELETE FROM files WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2",
        )
        .bind(exact)
        .bind(&prefix)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let folders = if files_only {
            0
        } else {
            sqlx::query("DELETE FROM folders WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2")
                .bind(exact)
                .bind(&prefix)
                .execute(&mut *tx)
                .await?
                .rows_affected()
        };
        tx.commit().await?;
        Ok(files + folders)
    }

    pub async fn remove_by_id(&self, id: RemoteId) -> Result<u64, IndexError> {
        let files = sqlx::query("DELETE FROM files WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let folders = sqlx::query("DELETE FROM folders WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(files.rows_affected() + folders.rows_affected())
    }

    /// Points row `id` at `new_path`, evicting any other row holding that path.
    /// Name and parent follow the new path; the parent id is only rewritten
    /// when the new parent folder is indexed.
    pub async fn update_path(&self, id: RemoteId, new_path: &str) -> Result<u64, IndexError> {
        let (parent, name) = match new_path.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((parent, name)) => (parent, name),
            None => ("/", new_path),
        };
        let mut tx = self.pool.begin().await?;
        for table in ["files", "folders"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE path = ?1 AND id != ?2"))
                .bind(new_path)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let mut updated = 0;
        for table in ["files", "folders"] {
            let sql = format!(
                "UPDATE {table} SET path = ?1, name = ?2,
                    parent_id = COALESCE((SELECT id FROM folders WHERE path = ?3), parent_id)
                 WHERE id = ?4"
            );
            updated += sqlx::query(&sql)
                .bind(new_path)
                .bind(name)
                .bind(parent)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// Renames row `id` in place, rewriting the last segment of its path.
    pub async fn update_name(&self, id: RemoteId, new_name: &str) -> Result<u64, IndexError> {
        let Some(row) = self.get_by_id(id).await? else {
            return Ok(0);
        };
        let new_path = match row.path.rsplit_once('/') {
            Some((parent, _)) => format!("{parent}/{new_name}"),
            None => format!("/{new_name}"),
        };
        self.update_path(id, &new_path).await
    }

    pub async fn list_files_under(&self, path: &str) -> Result<Vec<IndexRow>, IndexError> {
        let exact = path.trim_end_matches('/');
        let prefix = format!("{exact}/");
        let rows = sqlx::query(
            "SELECT id, parent_id, name, path, pickcode, sha1, size
             FROM files
             WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2
             ORDER BY path ASC",
        )
        .bind(exact)
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_row).collect()
    }

    pub async fn count(&self) -> Result<IndexCounts, IndexError> {
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let folders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM folders")
            .fetch_one(&self.pool)
            .await?;
        Ok(IndexCounts { files, folders })
    }

    pub async fn load_cursor(&self) -> Result<LifeCursor, IndexError> {
        let row = sqlx::query("SELECT last_time, last_event_id FROM life_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(LifeCursor {
                time: row.try_get("last_time")?,
                id: row.try_get("last_event_id")?,
            }),
            None => Ok(LifeCursor::default()),
        }
    }

    pub async fn store_cursor(&self, cursor: LifeCursor) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO life_cursor (id, last_time, last_event_id)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                last_time = excluded.last_time,
                last_event_id = excluded.last_event_id",
        )
        .bind(cursor.time)
        .bind(cursor.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn file_row(row: &SqliteRow) -> Result<IndexRow, IndexError> {
    Ok(IndexRow {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        name: row.try_get("name")?,
        path: row.try_get("path")?,
        kind: EntryKind::File,
        pickcode: row.try_get("pickcode")?,
        sha1: row.try_get("sha1")?,
        size: row.try_get("size")?,
    })
}

fn folder_row(row: &SqliteRow) -> Result<IndexRow, IndexError> {
    Ok(IndexRow {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        name: row.try_get("name")?,
        path: row.try_get("path")?,
        kind: EntryKind::Dir,
        pickcode: None,
        sha1: None,
        size: None,
    })
}

fn default_db_path() -> Result<PathBuf, IndexError> {
    let mut path = dirs::data_dir().ok_or(IndexError::MissingDataDir)?;
    path.push("strm-mirror");
    path.push("index.db");
    Ok(path)
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use strm_core::RemoteId;

use crate::config::SyncRootMapping;
use crate::sync::generate::Generator;
use crate::sync::id_cache::IdPathCache;
use crate::sync::placeholder::{
    file_ext, prune_empty_ancestors, remote_dir_for, remove_placeholder,
};
use crate::sync::tree_diff::{SnapshotWriter, diff};
use crate::sync::{SyncError, parent_path};

/// Writes every placeholder below `root` into a snapshot at `out`.
pub async fn scan_placeholders(
    root: PathBuf,
    placeholder_ext: String,
    out: PathBuf,
) -> Result<PathBuf, SyncError> {
    let mut writer = SnapshotWriter::create(out).await?;
    let mut pending = vec![root];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file()
                && file_ext(&entry.file_name().to_string_lossy()).as_deref()
                    == Some(placeholder_ext.as_str())
            {
                writer.push_path(&path).await?;
            }
        }
    }
    Ok(writer.finish().await?)
}

/// Deletes placeholders listed in `local` but absent from `expected` and
/// returns the ones actually removed.
///
/// Nothing is deleted when the candidate count exceeds `threshold`.
pub async fn prune_orphans(
    mapping: &SyncRootMapping,
    local: &Path,
    expected: &Path,
    threshold: usize,
    max_depth: usize,
) -> Result<Vec<PathBuf>, SyncError> {
    let candidates = diff(local, expected).await?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    if candidates.len() > threshold {
        tracing::warn!(
            mapping = %mapping.local_root.display(),
            candidates = candidates.len(),
            threshold,
            "orphan count exceeds safety threshold, skipping prune"
        );
        return Ok(Vec::new());
    }

    let mut pruned = Vec::new();
    for candidate in candidates {
        let path = PathBuf::from(&candidate.path);
        if !path.starts_with(&mapping.local_root) {
            continue;
        }
        match remove_placeholder(&path).await {
            Ok(true) => {
                tracing::debug!(path = %path.display(), "pruned orphan placeholder");
                if let Some(parent) = path.parent() {
                    prune_empty_ancestors(parent, &mapping.local_root, max_depth).await?;
                }
                pruned.push(path);
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not prune placeholder")
            }
        }
    }
    Ok(pruned)
}

/// Drops the index rows of files whose placeholder was pruned, so later
/// lookups by path fall through to the drive.
pub async fn forget_pruned(
    mapping: &SyncRootMapping,
    generator: &Generator,
    cache: &IdPathCache,
    pruned: &[PathBuf],
) -> Result<u64, SyncError> {
    let index = cache.index();
    let mut forgotten = 0;
    for placeholder in pruned {
        let Some(remote_dir) = placeholder
            .parent()
            .and_then(|dir| remote_dir_for(mapping, dir))
        else {
            continue;
        };
        for row in index.list_files_under(&remote_dir).await? {
            if parent_path(&row.path) != remote_dir
                || !generator.policy().is_media_path(&row.path)
                || generator.target_for(mapping, &row.path).as_ref() != Some(placeholder)
            {
                continue;
            }
            forgotten += index.remove_by_id(row.id).await?;
            cache.remove_id(row.id);
        }
    }
    if forgotten > 0 {
        tracing::debug!(forgotten, "dropped index rows of pruned placeholders");
    }
    Ok(forgotten)
}

/// Drops file rows below the mapping's remote root that a complete walk did
/// not report.
pub async fn forget_unseen(
    mapping: &SyncRootMapping,
    cache: &IdPathCache,
    seen: &HashSet<RemoteId>,
) -> Result<u64, SyncError> {
    let index = cache.index();
    let mut forgotten = 0;
    for row in index.list_files_under(&mapping.remote_root).await? {
        if seen.contains(&row.id) {
            continue;
        }
        tracing::debug!(id = row.id, path = %row.path, "forgetting vanished file");
        forgotten += index.remove_by_id(row.id).await?;
        cache.remove_id(row.id);
    }
    Ok(forgotten)
}

use std::path::Path;
use std::sync::Arc;

use strm_core::{DriveApi, RemoteEntry, RemoteId};
use tokio_util::sync::CancellationToken;

use crate::config::{SyncConfig, SyncRootMapping, is_under};
use crate::sync::generate::{Generator, ItemOutcome};
use crate::sync::id_cache::IdPathCache;
use crate::sync::index::{IndexRow, PathIndex};
use crate::sync::placeholder::{file_ext, local_path_for};
use crate::sync::prune::{forget_pruned, prune_orphans, scan_placeholders};
use crate::sync::summary::{REASON_UNRESOLVED, SyncSummary};
use crate::sync::transfer::SidecarDownloader;
use crate::sync::tree_diff::{SnapshotWriter, diff, read_lines_at};
use crate::sync::{SyncError, child_path, discard_run_dir, parent_path, run_dir};

const REASON_ANCESTOR_STALLED: &str = "ancestor walk stalled";

/// Generates placeholders only for remote files that have none locally,
/// found by diffing a server-side export against a local scan.
pub struct IncrementalSyncEngine {
    config: Arc<SyncConfig>,
    drive: Arc<dyn DriveApi>,
    index: Arc<PathIndex>,
    cache: Arc<IdPathCache>,
    generator: Generator,
    downloader: SidecarDownloader,
}

impl IncrementalSyncEngine {
    pub fn new(
        config: Arc<SyncConfig>,
        drive: Arc<dyn DriveApi>,
        index: Arc<PathIndex>,
        cache: Arc<IdPathCache>,
    ) -> Self {
        Self {
            generator: Generator::new(config.clone()),
            downloader: SidecarDownloader::new(drive.clone(), &config),
            config,
            drive,
            index,
            cache,
        }
    }

    #[tracing::instrument(skip_all, fields(mapping = %mapping.local_root.display()))]
    pub async fn run(
        &self,
        mapping: &SyncRootMapping,
        stop: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let root_id = self
            .cache
            .get_by_dir(&mapping.remote_root)
            .await?
            .ok_or_else(|| SyncError::RootNotFound(mapping.remote_root.clone()))?;

        let dir = run_dir(&self.config.work_dir, "incr", mapping).await?;
        let result = self.reconcile(mapping, root_id, &dir, stop).await;
        discard_run_dir(&dir).await;

        let summary = result?;
        tracing::info!(%summary, "incremental sync finished");
        Ok(summary)
    }

    async fn reconcile(
        &self,
        mapping: &SyncRootMapping,
        root_id: RemoteId,
        dir: &Path,
        stop: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let scan = tokio::spawn(scan_placeholders(
            mapping.local_root.clone(),
            self.config.placeholder_ext.clone(),
            dir.join("local.txt"),
        ));

        let remote_paths = self.drive.export_tree(root_id).await?;
        let mut targets = SnapshotWriter::create(dir.join("remote_targets.txt")).await?;
        let mut sources = SnapshotWriter::create(dir.join("remote_sources.txt")).await?;
        let mut missing_sidecars = Vec::new();
        let policy = self.generator.policy();

        for remote_path in remote_paths {
            if !mapping.contains_remote(&remote_path) || !policy.is_candidate_path(&remote_path) {
                continue;
            }
            let name = remote_path.rsplit('/').next().unwrap_or_default();
            let is_sidecar =
                file_ext(name).is_some_and(|ext| self.config.sidecar_exts.contains(&ext));
            if is_sidecar {
                if let Ok(local) = local_path_for(mapping, &remote_path)
                    && !tokio::fs::try_exists(&local).await.unwrap_or(false)
                {
                    missing_sidecars.push(remote_path);
                }
                continue;
            }
            let Some(target) = self.generator.target_for(mapping, &remote_path) else {
                continue;
            };
            targets.push_path(&target).await?;
            sources.push(&remote_path).await?;
        }
        let targets = targets.finish().await?;
        let sources = sources.finish().await?;
        let local = scan.await??;

        let lines: Vec<u64> = diff(&targets, &local)
            .await?
            .into_iter()
            .map(|entry| entry.line)
            .collect();
        let mut missing = read_lines_at(&sources, &lines).await?;
        missing.extend(missing_sidecars);
        tracing::debug!(missing = missing.len(), "remote items without a local placeholder");

        let mut summary = SyncSummary::default();
        let mut sidecars = Vec::new();
        for remote_path in missing {
            if stop.is_cancelled() {
                tracing::info!("stop requested, leaving remaining items for the next run");
                return Ok(summary);
            }
            let entry = match self.resolve_entry(&remote_path).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    summary.fail(REASON_UNRESOLVED);
                    continue;
                }
                Err(err @ SyncError::AncestorStalled { .. }) => {
                    tracing::warn!(path = %remote_path, error = %err, "giving up on item");
                    summary.fail(REASON_ANCESTOR_STALLED);
                    continue;
                }
                Err(err) => {
                    tracing::warn!(path = %remote_path, error = %err, "cannot resolve item");
                    summary.fail(REASON_UNRESOLVED);
                    continue;
                }
            };
            let outcome = self
                .generator
                .materialize(mapping, &remote_path, &entry)
                .await;
            outcome.record(&mut summary);
            if let ItemOutcome::Sidecar(job) = outcome {
                sidecars.push(job);
            }
        }

        if !sidecars.is_empty() {
            summary.merge(self.downloader.download_all(sidecars).await);
        }
        if self.config.prune_orphans {
            let pruned = prune_orphans(
                mapping,
                &local,
                &targets,
                self.config.prune_threshold,
                self.config.prune_max_depth,
            )
            .await?;
            summary.pruned += pruned.len() as u64;
            forget_pruned(mapping, &self.generator, &self.cache, &pruned).await?;
        }
        Ok(summary)
    }

    /// Looks `path` up in the index, otherwise lists the deepest known
    /// ancestor and backfills the index until the item shows up.
    pub async fn resolve_entry(&self, path: &str) -> Result<Option<RemoteEntry>, SyncError> {
        if let Some(row) = self.index.get_by_path_healing(path).await?
            && !row.is_dir()
        {
            return Ok(Some(row.to_entry()));
        }

        let page_size = self.config.page_size;
        let max_pages = self.config.listing_max_pages;
        let mut previous: Option<RemoteId> = None;
        loop {
            let (ancestor, ancestor_id) = self.deepest_known_ancestor(path).await?;
            if previous == Some(ancestor_id) {
                return Err(SyncError::AncestorStalled {
                    target: path.to_string(),
                    ancestor,
                    id: ancestor_id,
                });
            }
            previous = Some(ancestor_id);

            let children = self
                .drive
                .list_dir_all(ancestor_id, page_size, max_pages)
                .await?;
            let truncated =
                children.len() as u64 >= u64::from(page_size) * u64::from(max_pages.max(1));
            let rows: Vec<IndexRow> = children
                .iter()
                .map(|child| IndexRow::from_entry(child, child_path(&ancestor, &child.name)))
                .collect();
            self.index.upsert_batch(&rows).await?;

            let mut on_route = false;
            for (row, child) in rows.iter().zip(&children) {
                if row.is_dir() {
                    self.cache.add(row.id, &row.path);
                    on_route |= is_under(path, &row.path);
                } else if row.path == path {
                    return Ok(Some(child.clone()));
                }
            }
            if !on_route && !truncated {
                tracing::debug!(path, ancestor = %ancestor, "item no longer exists remotely");
                return Ok(None);
            }
        }
    }

    async fn deepest_known_ancestor(&self, path: &str) -> Result<(String, RemoteId), SyncError> {
        let mut current = parent_path(path);
        loop {
            if let Some(id) = self.cache.peek_dir(current).await? {
                return Ok((current.to_string(), id));
            }
            current = parent_path(current);
        }
    }
}

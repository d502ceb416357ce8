use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use strm_core::{DriveApi, RemoteId};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{SyncConfig, SyncRootMapping};
use crate::sync::generate::{Generator, ItemOutcome};
use crate::sync::id_cache::IdPathCache;
use crate::sync::index::{IndexRow, PathIndex};
use crate::sync::prune::{forget_unseen, prune_orphans, scan_placeholders};
use crate::sync::summary::SyncSummary;
use crate::sync::transfer::{SidecarDownloader, SidecarJob};
use crate::sync::tree_diff::SnapshotWriter;
use crate::sync::{SyncError, discard_run_dir, run_dir};

/// Walks the whole remote subtree of a mapping and reconciles every file.
pub struct FullSyncEngine {
    config: Arc<SyncConfig>,
    drive: Arc<dyn DriveApi>,
    index: Arc<PathIndex>,
    cache: Arc<IdPathCache>,
    generator: Generator,
    downloader: SidecarDownloader,
}

impl FullSyncEngine {
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
        tracing::info!(remote_root = %mapping.remote_root, root_id, "full sync started");

        let dir = run_dir(&self.config.work_dir, "full", mapping).await?;
        let result = self.walk(mapping, root_id, &dir, stop).await;
        discard_run_dir(&dir).await;

        let summary = result?;
        tracing::info!(%summary, "full sync finished");
        Ok(summary)
    }

    async fn walk(
        &self,
        mapping: &SyncRootMapping,
        root_id: RemoteId,
        dir: &Path,
        stop: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let scan = self.config.prune_orphans.then(|| {
            tokio::spawn(scan_placeholders(
                mapping.local_root.clone(),
                self.config.placeholder_ext.clone(),
                dir.join("local.txt"),
            ))
        });
        let mut targets = SnapshotWriter::create(dir.join("targets.txt")).await?;

        let mut summary = SyncSummary::default();
        let mut sidecars: Vec<SidecarJob> = Vec::new();
        let mut workers = WorkerPool::new(self.config.max_workers);
        let page_size = self.config.page_size;
        let mut offset = 0u32;
        let mut completed = true;
        let mut seen = HashSet::new();

        loop {
            if stop.is_cancelled() {
                tracing::info!(offset, "stop requested, draining in-flight items");
                completed = false;
                break;
            }
            let page = match self.drive.list_descendants(root_id, offset, page_size).await {
                Ok(page) => page,
                Err(err) => {
                    for outcome in workers.drain().await {
                        outcome.record(&mut summary);
                    }
                    return Err(err.into());
                }
            };
            let fetched = page.items.len() as u32;

            let mut rows = Vec::with_capacity(page.items.len());
            for walked in page.items {
                let row = IndexRow::from_walked(&walked);
                self.cache.add(row.id, &row.path);
                seen.insert(row.id);
                if !walked.entry.is_dir() {
                    let generator = self.generator.clone();
                    let mapping = mapping.clone();
                    let path = row.path.clone();
                    workers
                        .spawn(async move {
                            generator.materialize(&mapping, &path, &walked.entry).await
                        })
                        .await;
                }
                rows.push(row);
            }
            self.index.upsert_batch(&rows).await?;

            for outcome in workers.finished() {
                self.collect(outcome, &mut targets, &mut sidecars, &mut summary)
                    .await?;
            }

            offset = offset.saturating_add(fetched);
            if fetched == 0 || offset >= page.total {
                break;
            }
        }

        for outcome in workers.drain().await {
            self.collect(outcome, &mut targets, &mut sidecars, &mut summary)
                .await?;
        }
        let targets = targets.finish().await?;

        if let Some(scan) = scan {
            let local = scan.await??;
            if completed {
                let pruned = prune_orphans(
                    mapping,
                    &local,
                    &targets,
                    self.config.prune_threshold,
                    self.config.prune_max_depth,
                )
                .await?;
                summary.pruned += pruned.len() as u64;
            }
        }
        if completed {
            forget_unseen(mapping, &self.cache, &seen).await?;
        }

        if !sidecars.is_empty() && !stop.is_cancelled() {
            summary.merge(self.downloader.download_all(sidecars).await);
        }
        Ok(summary)
    }

    async fn collect(
        &self,
        outcome: ItemOutcome,
        targets: &mut SnapshotWriter,
        sidecars: &mut Vec<SidecarJob>,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        outcome.record(summary);
        if let Some(target) = outcome.target() {
            targets.push_path(&target).await?;
        }
        if let ItemOutcome::Sidecar(job) = outcome {
            sidecars.push(job);
        }
        Ok(())
    }
}

/// `max_workers` concurrent item tasks. Finished results are handed back to
/// the walking task so snapshot writes stay single-threaded.
struct WorkerPool {
    permits: Arc<Semaphore>,
    tasks: JoinSet<ItemOutcome>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            tasks: JoinSet::new(),
        }
    }

    async fn spawn<F>(&mut self, item: F)
    where
        F: Future<Output = ItemOutcome> + Send + 'static,
    {
        // The semaphore is never closed, so acquisition only waits.
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        self.tasks.spawn(async move {
            let outcome = item.await;
            drop(permit);
            outcome
        });
    }

    fn finished(&mut self) -> Vec<ItemOutcome> {
        let mut done = Vec::new();
        while let Some(result) = self.tasks.try_join_next() {
            done.push(Self::outcome(result));
        }
        done
    }

    async fn drain(&mut self) -> Vec<ItemOutcome> {
        let mut done = Vec::new();
        while let Some(result) = self.tasks.join_next().await {
            done.push(Self::outcome(result));
        }
        done
    }

    fn outcome(result: Result<ItemOutcome, tokio::task::JoinError>) -> ItemOutcome {
        result.unwrap_or_else(|err| {
            tracing::error!(error = %err, "item worker panicked");
            ItemOutcome::Failed("worker panicked")
        })
    }
}

#[cfg(test)]
#[path = "full_tests.rs"]
mod tests;

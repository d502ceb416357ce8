use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use strm_core::{DriveApi, EntryKind, LifeEvent, LifeEventKind, RemoteEntry, RemoteId};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{Collaborators, refresh_media};
use crate::config::{SyncConfig, SyncRootMapping};
use crate::sync::backoff::Backoff;
use crate::sync::generate::{Generator, ItemOutcome};
use crate::sync::id_cache::IdPathCache;
use crate::sync::index::{IndexRow, PathIndex};
use crate::sync::placeholder::{
    file_ext, local_path_for, prune_empty_ancestors, remove_placeholder, remove_tree,
};
use crate::sync::summary::{REASON_UNRESOLVED, SyncSummary};
use crate::sync::transfer::SidecarDownloader;
use crate::sync::{SyncError, child_path, parent_path};

const CLAIM_CAPACITY: u64 = 100_000;
const REASON_EVENT_FAILED: &str = "event handling failed";

/// Ids currently owned by the monitor or by the pending-transfer pipeline.
/// A claim expires after its TTL.
pub struct ClaimTable {
    monitor: Cache<RemoteId, ()>,
    transfer: Cache<RemoteId, ()>,
}

impl ClaimTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            monitor: Cache::builder()
                .max_capacity(CLAIM_CAPACITY)
                .time_to_live(ttl)
                .build(),
            transfer: Cache::builder()
                .max_capacity(CLAIM_CAPACITY)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// `false` when the transfer side already owns `id`.
    pub fn claim_for_monitor(&self, id: RemoteId) -> bool {
        if self.transfer.contains_key(&id) {
            return false;
        }
        self.monitor.insert(id, ());
        true
    }

    /// `false` when the monitor already owns `id`.
    pub fn claim_for_transfer(&self, id: RemoteId) -> bool {
        if self.monitor.contains_key(&id) {
            return false;
        }
        self.transfer.insert(id, ());
        true
    }

    pub fn release(&self, id: RemoteId) {
        self.monitor.invalidate(&id);
        self.transfer.invalidate(&id);
    }
}

/// Final name and location reported by a transfer-completion notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameHint {
    pub name: String,
    /// Remote folder the item was organized into.
    pub target_dir: String,
    /// Remote folder it was originally saved to.
    pub remote_dir: String,
}

pub struct RenameLedger {
    hints: Cache<RemoteId, RenameHint>,
}

impl RenameLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            hints: Cache::builder()
                .max_capacity(CLAIM_CAPACITY)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn record(&self, id: RemoteId, hint: RenameHint) {
        self.hints.insert(id, hint);
    }

    pub fn take(&self, id: RemoteId) -> Option<RenameHint> {
        self.hints.remove(&id)
    }
}

/// Handed to the transfer pipeline with each file. The file stays claimed by
/// the transfer side until the ticket is completed, abandoned, or expires.
pub struct TransferTicket {
    id: RemoteId,
    claims: Arc<ClaimTable>,
    renames: Arc<RenameLedger>,
}

impl TransferTicket {
    pub fn id(&self) -> RemoteId {
        self.id
    }

    /// The file was organized into its final place. The next creation event
    /// for it is placed according to `hint`.
    pub fn complete(self, hint: RenameHint) {
        self.renames.record(self.id, hint);
        self.claims.release(self.id);
    }

    pub fn abandon(self) {
        self.claims.release(self.id);
    }
}

/// What one polled batch did.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub events: usize,
    pub summary: SyncSummary,
    pub removed: u64,
    pub refresh: Vec<PathBuf>,
}

/// Follows the drive's change feed and keeps placeholders and the index in
/// step with it.
pub struct LifeEventMonitor {
    config: Arc<SyncConfig>,
    drive: Arc<dyn DriveApi>,
    index: Arc<PathIndex>,
    cache: Arc<IdPathCache>,
    generator: Generator,
    downloader: SidecarDownloader,
    claims: Arc<ClaimTable>,
    renames: Arc<RenameLedger>,
    collaborators: Collaborators,
}

impl LifeEventMonitor {
    pub fn new(
        config: Arc<SyncConfig>,
        drive: Arc<dyn DriveApi>,
        index: Arc<PathIndex>,
        cache: Arc<IdPathCache>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            generator: Generator::new(config.clone()),
            downloader: SidecarDownloader::new(drive.clone(), &config),
            claims: Arc::new(ClaimTable::new(config.monitor.claim_ttl)),
            renames: Arc::new(RenameLedger::new(config.monitor.rename_ttl)),
            config,
            drive,
            index,
            cache,
            collaborators,
        }
    }

    /// Polls until `stop` fires. Fetch failures are retried after the poll
    /// interval; anything else is returned to the supervisor.
    pub async fn run(&self, stop: &CancellationToken) -> Result<(), SyncError> {
        let monitor = &self.config.monitor;
        let busy = Backoff::new(monitor.busy_backoff_base, monitor.busy_backoff_max, true);
        let mut busy_attempt = 0u32;
        tracing::info!("life event monitor started");

        while !stop.is_cancelled() {
            if self.collaborators.activity.is_busy() {
                let delay = busy.delay(busy_attempt);
                busy_attempt = busy_attempt.saturating_add(1);
                tracing::debug!(?delay, "transfer chain busy, pausing monitor");
                sleep_or_stop(delay, stop).await;
                continue;
            }
            busy_attempt = 0;

            match self.poll_once().await {
                Ok(report) if report.events == 0 => {
                    sleep_or_stop(monitor.poll_interval, stop).await;
                }
                Ok(report) => {
                    tracing::info!(
                        events = report.events,
                        removed = report.removed,
                        summary = %report.summary,
                        "life events processed"
                    );
                }
                Err(SyncError::Drive(err)) => {
                    tracing::warn!(error = %err, "life event fetch failed, cursor kept");
                    sleep_or_stop(monitor.poll_interval, stop).await;
                }
                Err(err) => return Err(err),
            }
        }
        tracing::info!("life event monitor stopped");
        Ok(())
    }

    /// Fetches and applies one batch, then commits the cursor. An event whose
    /// handling fails is counted and skipped; only index failures abort the
    /// batch before the cursor moves.
    pub async fn poll_once(&self) -> Result<BatchReport, SyncError> {
        let cursor = self.index.load_cursor().await?;
        let mut events = self
            .drive
            .life_events(cursor, self.config.monitor.batch_limit)
            .await?;
        events.reverse();
        events.retain(|event| event.cursor() > cursor);

        let mut report = BatchReport {
            events: events.len(),
            ..BatchReport::default()
        };
        let mut newest = cursor;
        for event in &events {
            match self.handle_event(event, &mut report).await {
                Ok(()) => {}
                Err(err @ SyncError::Index(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        event = event.id,
                        kind = event.kind.as_str(),
                        id = event.file_id,
                        error = %err,
                        "life event failed, moving on"
                    );
                    report.summary.fail(REASON_EVENT_FAILED);
                }
            }
            newest = newest.max(event.cursor());
        }
        if newest > cursor {
            self.index.store_cursor(newest).await?;
        }

        if !report.refresh.is_empty()
            && let Err(err) =
                refresh_media(self.collaborators.media_server.as_ref(), &report.refresh).await
        {
            tracing::warn!(error = %err, "media server refresh failed");
        }
        if report.summary.generated > 0 {
            let notifier = self.collaborators.notifier.clone();
            let text = format!("{} new placeholder(s)", report.summary.generated);
            tokio::spawn(async move {
                if let Err(err) = notifier.notify("strm sync", &text).await {
                    tracing::debug!(error = %err, "notification failed");
                }
            });
        }
        Ok(report)
    }

    pub async fn handle_event(
        &self,
        event: &LifeEvent,
        report: &mut BatchReport,
    ) -> Result<(), SyncError> {
        tracing::debug!(kind = event.kind.as_str(), id = event.file_id, "life event");
        match event.kind {
            LifeEventKind::NewFolder => self.handle_new_folder(event).await,
            LifeEventKind::Delete => self.handle_delete(event, report).await,
            kind if kind.is_creation() => self.handle_creation(event, report).await,
            _ => Ok(()),
        }
    }

    async fn handle_new_folder(&self, event: &LifeEvent) -> Result<(), SyncError> {
        let Some(parent) = self.cache.get_by_id(event.parent_id).await? else {
            tracing::debug!(id = event.file_id, "parent of new folder is unknown");
            return Ok(());
        };
        let mut entry = event.to_entry();
        entry.kind = EntryKind::Dir;
        let row = IndexRow::from_entry(&entry, child_path(&parent, &event.name));
        self.index.upsert_batch(std::slice::from_ref(&row)).await?;
        self.cache.add(row.id, &row.path);
        Ok(())
    }

    async fn handle_creation(
        &self,
        event: &LifeEvent,
        report: &mut BatchReport,
    ) -> Result<(), SyncError> {
        if !self.claims.claim_for_monitor(event.file_id) {
            tracing::debug!(id = event.file_id, "claimed by the transfer pipeline, skipping");
            return Ok(());
        }

        let mut entry = event.to_entry();
        let path = match self.renames.take(event.file_id) {
            Some(hint) => {
                tracing::debug!(id = event.file_id, name = %hint.name, "applying rename hint");
                entry.name = hint.name.clone();
                child_path(&hint.target_dir, &hint.name)
            }
            None => match self.cache.get_by_id(event.parent_id).await? {
                Some(parent) => child_path(&parent, &event.name),
                None => {
                    tracing::warn!(
                        id = event.file_id,
                        parent = event.parent_id,
                        "cannot resolve event path"
                    );
                    report.summary.fail(REASON_UNRESOLVED);
                    return Ok(());
                }
            },
        };

        let mut relocated = false;
        if matches!(event.kind, LifeEventKind::Move | LifeEventKind::Rename)
            && let Some(old) = self.index.get_by_id(event.file_id).await?
            && old.path != path
        {
            if old.is_dir() || self.config.is_transfer_path(&path) {
                report.removed += self.remove_local(&old).await?;
            } else {
                report.removed += self.relocate_file(&old, &path).await?;
                relocated = true;
            }
        }

        if self.config.is_transfer_path(&path) {
            self.hand_off(entry, path).await?;
            return Ok(());
        }

        let items = if entry.is_dir() {
            self.list_tree(&entry, &path).await?
        } else {
            vec![(path.clone(), entry.clone())]
        };
        if !relocated {
            let mut rows = vec![IndexRow::from_entry(&entry, path.clone())];
            rows.extend(
                items
                    .iter()
                    .filter(|(item_path, _)| *item_path != path)
                    .map(|(item_path, item)| IndexRow::from_entry(item, item_path.clone())),
            );
            self.index.upsert_batch(&rows).await?;
            for row in rows.iter().filter(|row| row.is_dir()) {
                self.cache.add(row.id, &row.path);
            }
        }

        let Some(mapping) = self.config.mapping_for_remote(&path) else {
            tracing::debug!(path = %path, "outside every mapping, indexed only");
            return Ok(());
        };
        let toggles = &self.config.monitor.toggles;
        if !toggles.generate.contains(&event.kind) {
            return Ok(());
        }

        let mut sidecars = Vec::new();
        for (item_path, item) in items.iter().filter(|(_, item)| !item.is_dir()) {
            let outcome = self.generator.materialize(mapping, item_path, item).await;
            outcome.record(&mut report.summary);
            match outcome {
                ItemOutcome::Generated(target) => {
                    if toggles.scrape.contains(&event.kind)
                        && let Err(err) = self.collaborators.scraper.scrape(&target).await
                    {
                        tracing::warn!(path = %target.display(), error = %err, "scrape failed");
                    }
                    if toggles.refresh.contains(&event.kind) {
                        report.refresh.push(target);
                    }
                }
                ItemOutcome::Sidecar(job) => sidecars.push(job),
                _ => {}
            }
        }
        if !sidecars.is_empty() {
            report
                .summary
                .merge(self.downloader.download_all(sidecars).await);
        }
        Ok(())
    }

    async fn handle_delete(
        &self,
        event: &LifeEvent,
        report: &mut BatchReport,
    ) -> Result<(), SyncError> {
        let Some(row) = self.index.get_by_id(event.file_id).await? else {
            tracing::warn!(
                id = event.file_id,
                name = %event.name,
                "delete event for an unindexed item, leaving the filesystem alone"
            );
            return Ok(());
        };
        report.removed += self.remove_local(&row).await?;

        if self.config.monitor.cascade_transfer_history {
            match self.collaborators.history.purge_under(&row.path).await {
                Ok(purged) => tracing::debug!(path = %row.path, purged, "transfer history purged"),
                Err(err) => tracing::warn!(path = %row.path, error = %err, "history purge failed"),
            }
        }
        self.claims.release(event.file_id);
        Ok(())
    }

    /// Deletes the local counterpart of an indexed row and its index rows.
    async fn remove_local(&self, row: &IndexRow) -> Result<u64, SyncError> {
        let mut removed = 0;
        if let Some(mapping) = self.config.mapping_for_remote(&row.path) {
            removed += self.remove_files(mapping, row).await?;
        }
        self.index.remove_by_path_prefix(&row.path, false).await?;
        self.index.remove_by_id(row.id).await?;
        self.cache.remove_path(&row.path);
        self.cache.remove_id(row.id);
        Ok(removed)
    }

    /// A moved or renamed file keeps its index row; only its placeholder
    /// is removed before being generated at `path`.
    async fn relocate_file(&self, old: &IndexRow, path: &str) -> Result<u64, SyncError> {
        let removed = match self.config.mapping_for_remote(&old.path) {
            Some(mapping) => self.remove_files(mapping, old).await?,
            None => 0,
        };
        if parent_path(&old.path) == parent_path(path) {
            let name = path.rsplit('/').next().unwrap_or(path);
            self.index.update_name(old.id, name).await?;
        } else {
            self.index.update_path(old.id, path).await?;
        }
        self.cache.remove_id(old.id);
        tracing::debug!(id = old.id, from = %old.path, to = %path, "index row relocated");
        Ok(removed)
    }

    async fn remove_files(
        &self,
        mapping: &SyncRootMapping,
        row: &IndexRow,
    ) -> Result<u64, SyncError> {
        let depth = self.config.prune_max_depth;
        if row.is_dir() {
            let local = local_path_for(mapping, &row.path)?;
            if local == mapping.local_root {
                tracing::warn!(path = %row.path, "refusing to delete a mapping root");
                return Ok(0);
            }
            let removed = remove_tree(&local).await?;
            if let Some(parent) = local.parent() {
                prune_empty_ancestors(parent, &mapping.local_root, depth).await?;
            }
            return Ok(u64::from(removed));
        }

        let is_sidecar = file_ext(&row.name)
            .is_some_and(|ext| self.config.sidecar_exts.contains(&ext));
        let local = if is_sidecar {
            local_path_for(mapping, &row.path).ok()
        } else {
            self.generator.target_for(mapping, &row.path)
        };
        let Some(local) = local else {
            return Ok(0);
        };
        let removed = remove_placeholder(&local).await?;
        if removed {
            tracing::debug!(path = %local.display(), "placeholder removed");
        }
        if let Some(parent) = local.parent() {
            prune_empty_ancestors(parent, &mapping.local_root, depth).await?;
        }
        Ok(u64::from(removed))
    }

    /// Gives media files below a transfer root to the pipeline, each with a
    /// ticket holding its transfer claim.
    async fn hand_off(&self, entry: RemoteEntry, path: String) -> Result<(), SyncError> {
        // The monitor's own claim on the event's item passes to the transfer side.
        self.claims.release(entry.id);
        let items = if entry.is_dir() {
            self.list_tree(&entry, &path).await?
        } else {
            vec![(path, entry)]
        };
        for (item_path, item) in items {
            if item.is_dir() {
                continue;
            }
            let is_media =
                file_ext(&item.name).is_some_and(|ext| self.config.media_exts.contains(&ext));
            if !is_media {
                continue;
            }
            if !self.claims.claim_for_transfer(item.id) {
                tracing::debug!(path = %item_path, "owned by the monitor, not handing off");
                continue;
            }
            tracing::debug!(path = %item_path, "handing off to the transfer pipeline");
            let ticket = TransferTicket {
                id: item.id,
                claims: self.claims.clone(),
                renames: self.renames.clone(),
            };
            if let Err(err) = self
                .collaborators
                .pipeline
                .enqueue(&item, &item_path, ticket)
                .await
            {
                tracing::warn!(path = %item_path, error = %err, "transfer enqueue failed");
                self.claims.release(item.id);
            }
        }
        Ok(())
    }

    /// Every entry below a folder, paired with its absolute path.
    async fn list_tree(
        &self,
        root: &RemoteEntry,
        root_path: &str,
    ) -> Result<Vec<(String, RemoteEntry)>, SyncError> {
        let mut out = Vec::new();
        let mut pending = vec![(root.id, root_path.to_string())];
        while let Some((dir_id, dir_path)) = pending.pop() {
            let children = self
                .drive
                .list_dir_all(dir_id, self.config.page_size, self.config.listing_max_pages)
                .await?;
            for child in children {
                let path = child_path(&dir_path, &child.name);
                if child.is_dir() {
                    pending.push((child.id, path.clone()));
                }
                out.push((path, child));
            }
        }
        Ok(out)
    }
}

async fn sleep_or_stop(delay: Duration, stop: &CancellationToken) {
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

#[cfg(test)]
#[path = "life_tests.rs"]
mod tests;

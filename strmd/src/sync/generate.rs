use std::path::PathBuf;
use std::sync::Arc;

use strm_core::{RemoteEntry, is_valid_pickcode};

use crate::config::{SyncConfig, SyncRootMapping};
use crate::sync::placeholder::{
    PlaceholderSource, WriteOutcome, file_ext, local_path_for, placeholder_url, target_path,
    write_placeholder,
};
use crate::sync::summary::{
    REASON_BELOW_MIN_SIZE, REASON_BLACKLISTED, REASON_EXISTING_PLACEHOLDER,
    REASON_INVALID_PICKCODE, REASON_PENDING_TRANSFER, REASON_UNSUPPORTED_EXT, SyncSummary,
};
use crate::sync::transfer::SidecarJob;

const REASON_UNMAPPABLE_PATH: &str = "unmappable path";
const REASON_WRITE_FAILED: &str = "write failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDecision {
    Placeholder { pickcode: String },
    Sidecar { pickcode: String },
    Skip(&'static str),
    Fail(&'static str),
}

/// Decides what a remote file turns into locally.
#[derive(Clone)]
pub struct EntryPolicy {
    config: Arc<SyncConfig>,
}

impl EntryPolicy {
    pub fn new(config: Arc<SyncConfig>) -> Self {
        Self { config }
    }

    pub fn classify(&self, remote_path: &str, entry: &RemoteEntry) -> EntryDecision {
        let config = &self.config;
        if config.is_transfer_path(remote_path) {
            return EntryDecision::Skip(REASON_PENDING_TRANSFER);
        }
        let ext = file_ext(&entry.name).unwrap_or_default();
        let pickcode = entry.pickcode.clone().unwrap_or_default();

        if config.sidecar_exts.contains(&ext) {
            if !config.auto_download_sidecars {
                return EntryDecision::Skip(REASON_UNSUPPORTED_EXT);
            }
            if !is_valid_pickcode(&pickcode) {
                return EntryDecision::Fail(REASON_INVALID_PICKCODE);
            }
            return EntryDecision::Sidecar { pickcode };
        }
        if !config.media_exts.contains(&ext) {
            return EntryDecision::Skip(REASON_UNSUPPORTED_EXT);
        }
        let lowered = remote_path.to_lowercase();
        if config.blacklist.iter().any(|word| lowered.contains(word)) {
            return EntryDecision::Skip(REASON_BLACKLISTED);
        }
        if entry.size.unwrap_or(0) < config.min_file_size {
            return EntryDecision::Skip(REASON_BELOW_MIN_SIZE);
        }
        if !is_valid_pickcode(&pickcode) {
            return EntryDecision::Fail(REASON_INVALID_PICKCODE);
        }
        EntryDecision::Placeholder { pickcode }
    }

    /// Cheap path-only filter used before an entry has been resolved.
    pub fn is_candidate_path(&self, remote_path: &str) -> bool {
        if self.config.is_transfer_path(remote_path) {
            return false;
        }
        match path_ext(remote_path) {
            Some(ext) => {
                self.config.media_exts.contains(&ext)
                    || (self.config.auto_download_sidecars && self.config.sidecar_exts.contains(&ext))
            }
            None => false,
        }
    }

    pub fn is_media_path(&self, remote_path: &str) -> bool {
        path_ext(remote_path).is_some_and(|ext| self.config.media_exts.contains(&ext))
    }
}

fn path_ext(remote_path: &str) -> Option<String> {
    file_ext(remote_path.rsplit('/').next().unwrap_or(remote_path))
}

#[derive(Debug)]
pub enum ItemOutcome {
    Generated(PathBuf),
    Unchanged(PathBuf),
    Kept(PathBuf),
    Sidecar(SidecarJob),
    Skipped(&'static str),
    Failed(&'static str),
    /// The placeholder could not be written; whatever is at the target stays.
    WriteFailed(PathBuf),
}

impl ItemOutcome {
    /// Sidecars are counted once their download finishes.
    pub fn record(&self, summary: &mut SyncSummary) {
        match self {
            ItemOutcome::Generated(_) => summary.generated += 1,
            ItemOutcome::Unchanged(_) => summary.unchanged += 1,
            ItemOutcome::Kept(_) => summary.skip(REASON_EXISTING_PLACEHOLDER),
            ItemOutcome::Sidecar(_) => {}
            ItemOutcome::Skipped(reason) => summary.skip(reason),
            ItemOutcome::Failed(reason) => summary.fail(reason),
            ItemOutcome::WriteFailed(_) => summary.fail(REASON_WRITE_FAILED),
        }
    }

    /// Placeholder path this item owns locally, kept out of pruning.
    pub fn target(&self) -> Option<&PathBuf> {
        match self {
            ItemOutcome::Generated(path)
            | ItemOutcome::Unchanged(path)
            | ItemOutcome::Kept(path)
            | ItemOutcome::WriteFailed(path) => Some(path),
            _ => None,
        }
    }
}

/// Applies [`EntryPolicy`] to one remote file and writes the result.
#[derive(Clone)]
pub struct Generator {
    config: Arc<SyncConfig>,
    policy: EntryPolicy,
}

impl Generator {
    pub fn new(config: Arc<SyncConfig>) -> Self {
        Self {
            policy: EntryPolicy::new(config.clone()),
            config,
        }
    }

    pub fn policy(&self) -> &EntryPolicy {
        &self.policy
    }

    /// Local placeholder path a media file at `remote_path` maps to.
    pub fn target_for(&self, mapping: &SyncRootMapping, remote_path: &str) -> Option<PathBuf> {
        target_path(mapping, remote_path, &self.config.placeholder_ext).ok()
    }

    pub async fn materialize(
        &self,
        mapping: &SyncRootMapping,
        remote_path: &str,
        entry: &RemoteEntry,
    ) -> ItemOutcome {
        match self.policy.classify(remote_path, entry) {
            EntryDecision::Skip(reason) => {
                tracing::debug!(path = remote_path, reason, "skipping entry");
                ItemOutcome::Skipped(reason)
            }
            EntryDecision::Fail(reason) => {
                tracing::warn!(path = remote_path, reason, "cannot generate placeholder");
                ItemOutcome::Failed(reason)
            }
            EntryDecision::Sidecar { pickcode } => match local_path_for(mapping, remote_path) {
                Ok(target) => ItemOutcome::Sidecar(SidecarJob {
                    pickcode,
                    remote_path: remote_path.to_string(),
                    target,
                }),
                Err(err) => {
                    tracing::warn!(path = remote_path, error = %err, "cannot map sidecar");
                    ItemOutcome::Failed(REASON_UNMAPPABLE_PATH)
                }
            },
            EntryDecision::Placeholder { pickcode } => {
                self.write(mapping, remote_path, PlaceholderSource::Pickcode(pickcode))
                    .await
            }
        }
    }

    async fn write(
        &self,
        mapping: &SyncRootMapping,
        remote_path: &str,
        source: PlaceholderSource,
    ) -> ItemOutcome {
        let target = match target_path(mapping, remote_path, &self.config.placeholder_ext) {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(path = remote_path, error = %err, "cannot map placeholder");
                return ItemOutcome::Failed(REASON_UNMAPPABLE_PATH);
            }
        };
        let url = placeholder_url(&self.config.redirect_base, &source);
        match write_placeholder(&target, url.as_str(), self.config.overwrite).await {
            Ok(WriteOutcome::Created | WriteOutcome::Replaced) => {
                tracing::debug!(path = %target.display(), "placeholder written");
                ItemOutcome::Generated(target)
            }
            Ok(WriteOutcome::Unchanged) => ItemOutcome::Unchanged(target),
            Ok(WriteOutcome::Kept) => ItemOutcome::Kept(target),
            Err(err) => {
                tracing::warn!(path = %target.display(), error = %err, "placeholder write failed");
                ItemOutcome::WriteFailed(target)
            }
        }
    }
}

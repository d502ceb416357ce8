use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use strm_core::{DriveApi, DriveClient};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::collaborators::Collaborators;
use crate::config::{SyncConfig, SyncRootMapping, read_u64_env};
use crate::http_api::{self, ApiState};
use crate::redirect::RedirectResolver;
use crate::supervisor::{RestartPolicy, Supervisor};
use crate::sync::full::FullSyncEngine;
use crate::sync::id_cache::IdPathCache;
use crate::sync::incremental::IncrementalSyncEngine;
use crate::sync::index::PathIndex;
use crate::sync::life::LifeEventMonitor;
use crate::sync::summary::SyncSummary;

const DEFAULT_LISTEN: &str = "127.0.0.1:9115";
const DEFAULT_FULL_SYNC_SECS: u64 = 24 * 60 * 60;
const DEFAULT_INCREMENTAL_SECS: u64 = 30 * 60;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub sync: SyncConfig,
    /// `None` talks to the client's built-in endpoint.
    pub drive_base_url: Option<String>,
    pub drive_cookie: String,
    pub listen: SocketAddr,
    pub db_path: Option<PathBuf>,
    pub full_sync_interval: Duration,
    pub incremental_interval: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let sync = SyncConfig::from_env().context("invalid sync configuration")?;

        let drive_base_url = std::env::var("STRM_DRIVE_BASE_URL").ok();
        let drive_cookie =
            std::env::var("STRM_DRIVE_COOKIE").context("STRM_DRIVE_COOKIE is not set")?;
        let listen = std::env::var("STRM_LISTEN")
            .unwrap_or_else(|_| DEFAULT_LISTEN.to_string())
            .parse()
            .context("STRM_LISTEN is not a socket address")?;
        let db_path = std::env::var("STRM_DB_PATH").ok().map(PathBuf::from);
        let full_sync_interval =
            Duration::from_secs(read_u64_env("STRM_FULL_SYNC_SECS", DEFAULT_FULL_SYNC_SECS));
        let incremental_interval = Duration::from_secs(read_u64_env(
            "STRM_INCREMENTAL_SECS",
            DEFAULT_INCREMENTAL_SECS,
        ));
        if full_sync_interval.is_zero() || incremental_interval.is_zero() {
            anyhow::bail!(
                "STRM_FULL_SYNC_SECS and STRM_INCREMENTAL_SECS must be greater than zero"
            );
        }

        Ok(Self {
            sync,
            drive_base_url,
            drive_cookie,
            listen,
            db_path,
            full_sync_interval,
            incremental_interval,
        })
    }
}

/// Which engine a scheduled pass should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    sync: Arc<SyncConfig>,
    drive: Arc<dyn DriveApi>,
    index: Arc<PathIndex>,
    cache: Arc<IdPathCache>,
    full: Arc<FullSyncEngine>,
    incremental: Arc<IncrementalSyncEngine>,
    resolver: Arc<RedirectResolver>,
    collaborators: Collaborators,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.sync.work_dir)
            .await
            .with_context(|| {
                format!("failed to create work dir at {:?}", config.sync.work_dir)
            })?;
        let drive = match &config.drive_base_url {
            Some(base_url) => DriveClient::with_base_url(base_url, config.drive_cookie.clone()),
            None => DriveClient::new(config.drive_cookie.clone()),
        }
        .context("failed to build drive client")?;
        let index = PathIndex::open(config.db_path.clone())
            .await
            .context("failed to initialize path index")?;
        let counts = index.count().await.context("failed to read path index")?;
        tracing::info!(files = counts.files, folders = counts.folders, "path index opened");
        Ok(Self::with_parts(
            config,
            Arc::new(drive),
            Arc::new(index),
            Collaborators::default(),
        ))
    }

    pub fn with_parts(
        config: DaemonConfig,
        drive: Arc<dyn DriveApi>,
        index: Arc<PathIndex>,
        collaborators: Collaborators,
    ) -> Self {
        let sync = Arc::new(config.sync.clone());
        let cache = Arc::new(IdPathCache::new(
            sync.id_cache_capacity,
            index.clone(),
            drive.clone(),
        ));
        let full = Arc::new(FullSyncEngine::new(
            sync.clone(),
            drive.clone(),
            index.clone(),
            cache.clone(),
        ));
        let incremental = Arc::new(IncrementalSyncEngine::new(
            sync.clone(),
            drive.clone(),
            index.clone(),
            cache.clone(),
        ));
        let resolver = Arc::new(RedirectResolver::new(drive.clone(), sync.redirect.clone()));
        Self {
            config,
            sync,
            drive,
            index,
            cache,
            full,
            incremental,
            resolver,
            collaborators,
        }
    }

    /// One pass over every mapping. A failing mapping does not stop the
    /// others; the first error is returned after all of them ran.
    pub async fn sync_all(
        &self,
        mode: SyncMode,
        stop: &CancellationToken,
    ) -> anyhow::Result<SyncSummary> {
        if mode == SyncMode::Full {
            // A full walk re-learns every id; stale entries must not outlive it.
            self.cache.clear();
        }
        let mut total = SyncSummary::default();
        let mut first_error = None;
        for mapping in &self.sync.mappings {
            if stop.is_cancelled() {
                break;
            }
            match self.sync_mapping(mode, mapping, stop).await {
                Ok(summary) => total.merge(summary),
                Err(err) => {
                    tracing::error!(
                        mapping = %mapping.local_root.display(),
                        error = %err,
                        "sync failed"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(total),
        }
    }

    async fn sync_mapping(
        &self,
        mode: SyncMode,
        mapping: &SyncRootMapping,
        stop: &CancellationToken,
    ) -> anyhow::Result<SyncSummary> {
        let summary = match mode {
            SyncMode::Full => self.full.run(mapping, stop).await,
            SyncMode::Incremental => self.incremental.run(mapping, stop).await,
        }
        .with_context(|| format!("{mode:?} sync of {}", mapping.remote_root))?;
        tracing::info!(
            mapping = %mapping.local_root.display(),
            ?mode,
            summary = %summary,
            "sync finished"
        );
        Ok(summary)
    }

    /// Full pass at start, then incremental passes, upgraded to a full pass
    /// once `full_sync_interval` has passed since the last one.
    async fn schedule(self: Arc<Self>, stop: CancellationToken) {
        let mut last_full = Instant::now();
        let _ = self.sync_all(SyncMode::Full, &stop).await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.incremental_interval) => {}
            }
            let mode = next_mode(last_full.elapsed(), self.config.full_sync_interval);
            if mode == SyncMode::Full {
                last_full = Instant::now();
            }
            let _ = self.sync_all(mode, &stop).await;
        }
        tracing::debug!("sync scheduler stopped");
    }

    pub fn monitor(&self) -> LifeEventMonitor {
        LifeEventMonitor::new(
            self.sync.clone(),
            self.drive.clone(),
            self.index.clone(),
            self.cache.clone(),
            self.collaborators.clone(),
        )
    }

    pub async fn serve(&self, stop: CancellationToken) -> anyhow::Result<()> {
        let state = ApiState {
            resolver: self.resolver.clone(),
        };
        http_api::serve(self.config.listen, state, stop).await
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            mappings = self.sync.mappings.len(),
            listen = %self.config.listen,
            monitor = self.sync.monitor.enabled,
            "strmd started"
        );
        let runtime = Arc::new(self);
        let stop = CancellationToken::new();
        let mut jobs = JoinSet::new();

        jobs.spawn(runtime.clone().schedule(stop.clone()));

        if runtime.sync.monitor.enabled {
            let monitor = runtime.monitor();
            let supervisor = Supervisor::new(
                "life-event-monitor",
                RestartPolicy::fixed(runtime.sync.monitor.restart_delay),
            );
            let stop = stop.clone();
            jobs.spawn(async move {
                supervisor.run(&stop, || monitor.run(&stop)).await;
            });
        }

        let server = runtime.clone();
        let server_stop = stop.clone();
        jobs.spawn(async move {
            if let Err(err) = server.serve(server_stop).await {
                tracing::error!(error = %err, "redirect endpoint stopped");
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        tracing::info!("shutdown requested, draining jobs");
        stop.cancel();
        while let Some(joined) = jobs.join_next().await {
            if let Err(err) = joined {
                tracing::warn!(error = %err, "job ended abnormally");
            }
        }
        Ok(())
    }
}

fn next_mode(since_full: Duration, full_interval: Duration) -> SyncMode {
    if since_full >= full_interval {
        SyncMode::Full
    } else {
        SyncMode::Incremental
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;

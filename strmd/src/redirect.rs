//! Turns a pickcode (or share credentials) into a short-lived download URL
//! for a given player, caching each URL until shortly before it expires.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use moka::sync::Cache;
use strm_core::{DownloadUrl, DriveApi, DriveError, RemoteId, ShareRef, is_valid_pickcode};
use thiserror::Error;
use url::Url;

use crate::config::RedirectConfig;

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("invalid pickcode: {0:?}")]
    InvalidPickcode(String),
    #[error("incomplete share reference")]
    InvalidShare,
    #[error("duplicated object has no pickcode")]
    MissingPickcode,
    #[error(transparent)]
    Drive(#[from] DriveError),
}

/// Wall clock in unix seconds. Swapped out in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    target: String,
    identity: String,
}

#[derive(Debug, Clone)]
struct CachedUrl {
    url: Url,
    expires_at: i64,
}

pub struct RedirectResolver {
    drive: Arc<dyn DriveApi>,
    config: RedirectConfig,
    clock: Arc<dyn Clock>,
    urls: Cache<CacheKey, CachedUrl>,
    /// First player per pickcode within the shared window.
    owners: Cache<String, String>,
}

impl RedirectResolver {
    pub fn new(drive: Arc<dyn DriveApi>, config: RedirectConfig) -> Self {
        Self::with_clock(drive, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        drive: Arc<dyn DriveApi>,
        config: RedirectConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            urls: Cache::builder().max_capacity(config.cache_capacity).build(),
            owners: Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_live(config.shared_window)
                .build(),
            drive,
            config,
            clock,
        }
    }

    pub async fn get_url(&self, pickcode: &str, identity: &str) -> Result<Url, RedirectError> {
        if !is_valid_pickcode(pickcode) {
            return Err(RedirectError::InvalidPickcode(pickcode.to_string()));
        }

        if self.config.shared_playback
            && let Some(scratch) = self.config.scratch_dir_id
        {
            let owner = self
                .owners
                .get_with(pickcode.to_string(), || identity.to_string());
            if owner != identity {
                return self.shared_copy_url(pickcode, identity, scratch).await;
            }
            // Each request from the owner renews the window.
            self.owners
                .insert(pickcode.to_string(), identity.to_string());
        }

        let key = CacheKey {
            target: pickcode.to_string(),
            identity: identity.to_string(),
        };
        if let Some(url) = self.cached(&key) {
            return Ok(url);
        }
        let minted = self.drive.download_url(pickcode, identity).await?;
        Ok(self.store(key, minted))
    }

    pub async fn get_share_url(
        &self,
        share: &ShareRef,
        identity: &str,
    ) -> Result<Url, RedirectError> {
        if share.share_code.is_empty() || share.receive_code.is_empty() {
            return Err(RedirectError::InvalidShare);
        }
        let key = CacheKey {
            target: format!("share:{}:{}", share.share_code, share.file_id),
            identity: identity.to_string(),
        };
        if let Some(url) = self.cached(&key) {
            return Ok(url);
        }
        let minted = self.drive.share_download_url(share, identity).await?;
        Ok(self.store(key, minted))
    }

    fn cached(&self, key: &CacheKey) -> Option<Url> {
        let hit = self.urls.get(key)?;
        if hit.expires_at > self.clock.now() {
            tracing::debug!(key = %key.target, "redirect cache hit");
            return Some(hit.url);
        }
        self.urls.invalidate(key);
        None
    }

    fn store(&self, key: CacheKey, minted: DownloadUrl) -> Url {
        self.store_until(key, minted, i64::MAX)
    }

    /// Like [`Self::store`], but never cached past `deadline`.
    fn store_until(&self, key: CacheKey, minted: DownloadUrl, deadline: i64) -> Url {
        let now = self.clock.now();
        let expires_at = match minted.embedded_expiry() {
            Some(expiry) => expiry - self.config.expiry_margin.as_secs() as i64,
            None => now + self.config.default_ttl.as_secs() as i64,
        }
        .min(deadline);
        if expires_at > now {
            self.urls.insert(
                key,
                CachedUrl {
                    url: minted.url.clone(),
                    expires_at,
                },
            );
        }
        minted.url
    }

    /// A player other than the owner gets its own copy, which is removed
    /// again once `duplicate_ttl` has passed. Its URL is cached per player
    /// for at most that long.
    async fn shared_copy_url(
        &self,
        pickcode: &str,
        identity: &str,
        scratch: RemoteId,
    ) -> Result<Url, RedirectError> {
        let key = CacheKey {
            target: format!("copy:{pickcode}"),
            identity: identity.to_string(),
        };
        if let Some(url) = self.cached(&key) {
            return Ok(url);
        }
        let entry = self.drive.entry_by_pickcode(pickcode).await?;
        let copy = self.drive.duplicate(entry.id, scratch).await?;
        tracing::info!(pickcode, copy = copy.id, "serving a duplicate to a second player");
        schedule_delete(self.drive.clone(), copy.id, self.config.duplicate_ttl);

        let copy_pickcode = copy.pickcode.ok_or(RedirectError::MissingPickcode)?;
        let minted = self.drive.download_url(&copy_pickcode, identity).await?;
        let deadline = self.clock.now() + self.config.duplicate_ttl.as_secs() as i64;
        Ok(self.store_until(key, minted, deadline))
    }
}

fn schedule_delete(drive: Arc<dyn DriveApi>, id: RemoteId, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        match drive.delete(&[id]).await {
            Ok(()) => tracing::debug!(id, "duplicate removed"),
            Err(err) => tracing::warn!(id, error = %err, "could not remove duplicate"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDrive;
    use std::sync::atomic::{AtomicI64, Ordering};
    use strm_core::ROOT_ID;

    const PICKCODE: &str = "ABCDEFGHIJKLMNOPQ";

    struct ManualClock(AtomicI64);

    impl ManualClock {
        fn set(&self, now: i64) {
            self.0.store(now, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn resolver(config: RedirectConfig) -> (Arc<FakeDrive>, Arc<ManualClock>, RedirectResolver) {
        let drive = Arc::new(FakeDrive::new());
        drive.add_dir(1, ROOT_ID, "Movies");
        drive.add_dir(9, ROOT_ID, "scratch");
        drive.add_file(3, 1, "Foo.mkv", 4096, PICKCODE);
        let clock = Arc::new(ManualClock(AtomicI64::new(1_700_000_000)));
        let resolver = RedirectResolver::with_clock(drive.clone(), config, clock.clone());
        (drive, clock, resolver)
    }

    #[tokio::test]
    async fn cached_url_is_reused() {
        let (drive, _clock, resolver) = resolver(RedirectConfig::default());
        let first = resolver.get_url(PICKCODE, "vlc").await.unwrap();
        let second = resolver.get_url(PICKCODE, "vlc").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(drive.calls("download_url"), 1);
    }

    #[tokio::test]
    async fn identities_are_cached_separately() {
        let (drive, _clock, resolver) = resolver(RedirectConfig::default());
        resolver.get_url(PICKCODE, "vlc").await.unwrap();
        resolver.get_url(PICKCODE, "kodi").await.unwrap();
        assert_eq!(drive.calls("download_url"), 2);
    }

    #[tokio::test]
    async fn expiry_minus_margin_forces_one_new_resolution() {
        let (drive, clock, resolver) = resolver(RedirectConfig::default());
        let first = resolver.get_url(PICKCODE, "vlc").await.unwrap();

        clock.set(1_700_003_299);
        assert_eq!(resolver.get_url(PICKCODE, "vlc").await.unwrap(), first);
        assert_eq!(drive.calls("download_url"), 1);

        drive.set_url_expiry(Some(1_700_007_200));
        clock.set(1_700_003_300);
        let refreshed = resolver.get_url(PICKCODE, "vlc").await.unwrap();
        assert_ne!(refreshed, first);
        assert_eq!(resolver.get_url(PICKCODE, "vlc").await.unwrap(), refreshed);
        assert_eq!(drive.calls("download_url"), 2);
    }

    #[tokio::test]
    async fn default_ttl_applies_without_embedded_expiry() {
        let (drive, clock, resolver) = resolver(RedirectConfig::default());
        drive.set_url_expiry(None);
        resolver.get_url(PICKCODE, "vlc").await.unwrap();

        clock.set(1_700_000_599);
        resolver.get_url(PICKCODE, "vlc").await.unwrap();
        assert_eq!(drive.calls("download_url"), 1);

        clock.set(1_700_000_600);
        resolver.get_url(PICKCODE, "vlc").await.unwrap();
        assert_eq!(drive.calls("download_url"), 2);
    }

    #[tokio::test]
    async fn nearly_expired_url_is_not_cached() {
        let (drive, _clock, resolver) = resolver(RedirectConfig::default());
        drive.set_url_expiry(Some(1_700_000_100));
        resolver.get_url(PICKCODE, "vlc").await.unwrap();
        resolver.get_url(PICKCODE, "vlc").await.unwrap();
        assert_eq!(drive.calls("download_url"), 2);
    }

    #[tokio::test]
    async fn malformed_pickcode_never_reaches_the_drive() {
        let (drive, _clock, resolver) = resolver(RedirectConfig::default());
        let err = resolver.get_url("../etc", "vlc").await.unwrap_err();
        assert!(matches!(err, RedirectError::InvalidPickcode(_)));
        assert_eq!(drive.calls("download_url"), 0);
    }

    #[tokio::test]
    async fn share_urls_are_cached_and_errors_surface() {
        let (drive, _clock, resolver) = resolver(RedirectConfig::default());
        let share = ShareRef {
            share_code: "sw1abc".into(),
            receive_code: "x1y2".into(),
            file_id: 3,
        };
        let first = resolver.get_share_url(&share, "vlc").await.unwrap();
        assert_eq!(resolver.get_share_url(&share, "vlc").await.unwrap(), first);
        assert_eq!(drive.calls("share_download_url"), 1);

        let expired = ShareRef {
            share_code: "expired".into(),
            ..share
        };
        let err = resolver.get_share_url(&expired, "vlc").await.unwrap_err();
        assert!(matches!(err, RedirectError::Drive(DriveError::ShareExpired(_))));
    }

    #[tokio::test]
    async fn second_player_gets_a_temporary_copy() {
        let (drive, _clock, resolver) = resolver(RedirectConfig {
            shared_playback: true,
            scratch_dir_id: Some(9),
            duplicate_ttl: Duration::from_millis(20),
            ..RedirectConfig::default()
        });

        let first = resolver.get_url(PICKCODE, "vlc").await.unwrap();
        assert_eq!(resolver.get_url(PICKCODE, "vlc").await.unwrap(), first);
        assert_eq!(drive.calls("duplicate"), 0);

        let other = resolver.get_url(PICKCODE, "kodi").await.unwrap();
        assert!(other.path().starts_with("/DUP"));
        assert_eq!(drive.calls("duplicate"), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(drive.deleted().len(), 1);
    }

    #[tokio::test]
    async fn owner_keeps_the_original_while_others_share_one_copy() {
        let (drive, _clock, resolver) = resolver(RedirectConfig {
            shared_playback: true,
            scratch_dir_id: Some(9),
            ..RedirectConfig::default()
        });

        let mut served = Vec::new();
        for player in ["vlc", "kodi", "kodi", "vlc", "kodi", "vlc"] {
            served.push(resolver.get_url(PICKCODE, player).await.unwrap());
        }

        let original = &served[0];
        let copy = &served[1];
        assert!(copy.path().starts_with("/DUP"));
        assert_eq!(
            served,
            vec![
                original.clone(),
                copy.clone(),
                copy.clone(),
                original.clone(),
                copy.clone(),
                original.clone(),
            ]
        );
        assert_eq!(drive.calls("duplicate"), 1);
    }
}

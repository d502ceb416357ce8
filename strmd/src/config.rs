use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use strm_core::{LifeEventKind, RemoteId};
use thiserror::Error;
use url::Url;

const DEFAULT_MEDIA_EXTS: &[&str] = &[
    ".mp4", ".mkv", ".avi", ".ts", ".m2ts", ".iso", ".mov", ".wmv", ".flv", ".rmvb", ".webm",
    ".mp3", ".flac", ".m4a", ".ape", ".wav",
];
const DEFAULT_SIDECAR_EXTS: &[&str] = &[".srt", ".ass", ".ssa", ".sub", ".nfo", ".jpg", ".png"];
const DEFAULT_PLACEHOLDER_EXT: &str = ".strm";
const DEFAULT_REDIRECT_BASE: &str = "http://127.0.0.1:9115";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no sync root mappings configured")]
    NoMappings,
    #[error("malformed mapping `{0}`, expected `local#remote`")]
    MalformedMapping(String),
    #[error("local root must be absolute: {0}")]
    RelativeLocalRoot(PathBuf),
    #[error("remote root must start with `/`: {0}")]
    RelativeRemoteRoot(String),
    #[error("placeholder extension must start with `.`: {0}")]
    PlaceholderExt(String),
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    #[error("extension {0} is configured as both media and sidecar")]
    OverlappingExt(String),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("invalid redirect base url: {0}")]
    RedirectBase(#[from] url::ParseError),
}

/// One reconciliation unit: a remote folder mirrored under a local folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRootMapping {
    pub local_root: PathBuf,
    pub remote_root: String,
}

impl SyncRootMapping {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<String>) -> Self {
        let remote_root: String = remote_root.into();
        let trimmed = remote_root.trim_end_matches('/');
        Self {
            local_root: local_root.into(),
            remote_root: if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            },
        }
    }

    pub fn contains_remote(&self, remote_path: &str) -> bool {
        is_under(remote_path, &self.remote_root)
    }
}

impl FromStr for SyncRootMapping {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (local, remote) = value
            .split_once('#')
            .ok_or_else(|| ConfigError::MalformedMapping(value.to_string()))?;
        let (local, remote) = (local.trim(), remote.trim());
        if local.is_empty() || remote.is_empty() {
            return Err(ConfigError::MalformedMapping(value.to_string()));
        }
        Ok(Self::new(local, remote))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwritePolicy {
    #[default]
    Never,
    Replace,
}

impl FromStr for OverwritePolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(OverwritePolicy::Never),
            "replace" | "always" => Ok(OverwritePolicy::Replace),
            other => Err(ConfigError::InvalidValue {
                name: "STRM_OVERWRITE",
                value: other.to_string(),
            }),
        }
    }
}

/// Which life-event kinds trigger each follow-up action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventToggles {
    pub generate: BTreeSet<LifeEventKind>,
    pub scrape: BTreeSet<LifeEventKind>,
    pub refresh: BTreeSet<LifeEventKind>,
}

impl Default for EventToggles {
    fn default() -> Self {
        let all: BTreeSet<_> = [
            LifeEventKind::Upload,
            LifeEventKind::Move,
            LifeEventKind::Rename,
            LifeEventKind::Copy,
            LifeEventKind::ReceiveShare,
        ]
        .into_iter()
        .collect();
        Self {
            generate: all.clone(),
            scrape: BTreeSet::new(),
            refresh: all,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub batch_limit: u32,
    pub restart_delay: Duration,
    pub busy_backoff_base: Duration,
    pub busy_backoff_max: Duration,
    pub claim_ttl: Duration,
    pub rename_ttl: Duration,
    pub toggles: EventToggles,
    pub cascade_transfer_history: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(20),
            batch_limit: 1000,
            restart_delay: Duration::from_secs(30),
            busy_backoff_base: Duration::from_secs(5),
            busy_backoff_max: Duration::from_secs(120),
            claim_ttl: Duration::from_secs(600),
            rename_ttl: Duration::from_secs(120),
            toggles: EventToggles::default(),
            cascade_transfer_history: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedirectConfig {
    pub expiry_margin: Duration,
    pub default_ttl: Duration,
    pub cache_capacity: u64,
    pub shared_playback: bool,
    pub shared_window: Duration,
    pub scratch_dir_id: Option<RemoteId>,
    pub duplicate_ttl: Duration,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            expiry_margin: Duration::from_secs(300),
            default_ttl: Duration::from_secs(600),
            cache_capacity: 10_000,
            shared_playback: false,
            shared_window: Duration::from_secs(30),
            scratch_dir_id: None,
            duplicate_ttl: Duration::from_secs(60),
        }
    }
}

/// Everything the reconciliation engines and the resolver read at runtime.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub mappings: Vec<SyncRootMapping>,
    pub redirect_base: Url,
    pub placeholder_ext: String,
    pub media_exts: BTreeSet<String>,
    pub sidecar_exts: BTreeSet<String>,
    pub auto_download_sidecars: bool,
    pub min_file_size: u64,
    pub blacklist: Vec<String>,
    pub overwrite: OverwritePolicy,
    pub transfer_roots: Vec<String>,
    pub max_workers: usize,
    pub page_size: u32,
    pub listing_max_pages: u32,
    pub prune_orphans: bool,
    pub prune_threshold: usize,
    pub prune_max_depth: usize,
    pub download_concurrency: usize,
    pub forbidden_trip_count: u32,
    pub id_cache_capacity: u64,
    pub work_dir: PathBuf,
    pub monitor: MonitorConfig,
    pub redirect: RedirectConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mappings: Vec::new(),
            redirect_base: Url::parse(DEFAULT_REDIRECT_BASE).expect("static url is valid"),
            placeholder_ext: DEFAULT_PLACEHOLDER_EXT.to_string(),
            media_exts: ext_set(DEFAULT_MEDIA_EXTS.iter().copied()),
            sidecar_exts: ext_set(DEFAULT_SIDECAR_EXTS.iter().copied()),
            auto_download_sidecars: false,
            min_file_size: 0,
            blacklist: Vec::new(),
            overwrite: OverwritePolicy::Never,
            transfer_roots: Vec::new(),
            max_workers: 8,
            page_size: 1000,
            listing_max_pages: 20,
            prune_orphans: false,
            prune_threshold: 500,
            prune_max_depth: 4,
            download_concurrency: 4,
            forbidden_trip_count: 3,
            id_cache_capacity: 100_000,
            work_dir: std::env::temp_dir().join("strmd"),
            monitor: MonitorConfig::default(),
            redirect: RedirectConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));

        if let Ok(raw) = std::env::var("STRM_MAPPINGS") {
            config.mappings = parse_mappings(&raw, &home)?;
        }
        if let Ok(raw) = std::env::var("STRM_REDIRECT_BASE") {
            config.redirect_base = Url::parse(raw.trim())?;
        }
        if let Ok(raw) = std::env::var("STRM_PLACEHOLDER_EXT") {
            config.placeholder_ext = raw.trim().to_ascii_lowercase();
        }
        if let Some(exts) = read_list_env("STRM_MEDIA_EXTS") {
            config.media_exts = ext_set(exts.iter().map(String::as_str));
        }
        if let Some(exts) = read_list_env("STRM_SIDECAR_EXTS") {
            config.sidecar_exts = ext_set(exts.iter().map(String::as_str));
        }
        config.auto_download_sidecars = read_bool_env("STRM_AUTO_DOWNLOAD_SIDECARS", false);
        config.min_file_size = read_u64_env("STRM_MIN_FILE_SIZE", 0);
        if let Some(words) = read_list_env("STRM_BLACKLIST") {
            config.blacklist = words.into_iter().map(|w| w.to_lowercase()).collect();
        }
        if let Ok(raw) = std::env::var("STRM_OVERWRITE") {
            config.overwrite = raw.parse()?;
        }
        if let Some(roots) = read_list_env("STRM_TRANSFER_ROOTS") {
            config.transfer_roots = roots
                .into_iter()
                .map(|r| normalize_remote(&r))
                .collect();
        }
        config.max_workers = read_u64_env("STRM_MAX_WORKERS", config.max_workers as u64) as usize;
        config.page_size = read_u64_env("STRM_PAGE_SIZE", u64::from(config.page_size)) as u32;
        config.prune_orphans = read_bool_env("STRM_PRUNE_ORPHANS", false);
        config.prune_threshold =
            read_u64_env("STRM_PRUNE_THRESHOLD", config.prune_threshold as u64) as usize;
        config.prune_max_depth =
            read_u64_env("STRM_PRUNE_DEPTH", config.prune_max_depth as u64) as usize;
        config.download_concurrency = read_u64_env(
            "STRM_DOWNLOAD_CONCURRENCY",
            config.download_concurrency as u64,
        ) as usize;
        if let Ok(raw) = std::env::var("STRM_WORK_DIR") {
            config.work_dir = expand_with_home(raw.trim(), &home);
        }

        let monitor = &mut config.monitor;
        monitor.enabled = read_bool_env("STRM_MONITOR_ENABLED", monitor.enabled);
        monitor.poll_interval = Duration::from_secs(read_u64_env(
            "STRM_MONITOR_POLL_SECS",
            monitor.poll_interval.as_secs(),
        ));
        monitor.cascade_transfer_history =
            read_bool_env("STRM_CASCADE_TRANSFER_HISTORY", false);
        if let Some(kinds) = read_kinds_env("STRM_GENERATE_ON")? {
            monitor.toggles.generate = kinds;
        }
        if let Some(kinds) = read_kinds_env("STRM_SCRAPE_ON")? {
            monitor.toggles.scrape = kinds;
        }
        if let Some(kinds) = read_kinds_env("STRM_REFRESH_ON")? {
            monitor.toggles.refresh = kinds;
        }

        let redirect = &mut config.redirect;
        redirect.expiry_margin = Duration::from_secs(read_u64_env(
            "STRM_URL_MARGIN_SECS",
            redirect.expiry_margin.as_secs(),
        ));
        redirect.shared_playback = read_bool_env("STRM_SHARED_PLAYBACK", false);
        if let Ok(raw) = std::env::var("STRM_SCRATCH_DIR_ID") {
            let id = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "STRM_SCRATCH_DIR_ID",
                value: raw.clone(),
            })?;
            redirect.scratch_dir_id = Some(id);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mappings.is_empty() {
            return Err(ConfigError::NoMappings);
        }
        for mapping in &self.mappings {
            if !mapping.local_root.is_absolute() {
                return Err(ConfigError::RelativeLocalRoot(mapping.local_root.clone()));
            }
            if !mapping.remote_root.starts_with('/') {
                return Err(ConfigError::RelativeRemoteRoot(mapping.remote_root.clone()));
            }
        }
        if !self.placeholder_ext.starts_with('.') || self.placeholder_ext.len() < 2 {
            return Err(ConfigError::PlaceholderExt(self.placeholder_ext.clone()));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Zero("max_workers"));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Zero("page_size"));
        }
        if self.download_concurrency == 0 {
            return Err(ConfigError::Zero("download_concurrency"));
        }
        if self.monitor.poll_interval.is_zero() {
            return Err(ConfigError::Zero("monitor.poll_interval"));
        }
        if let Some(ext) = self.media_exts.intersection(&self.sidecar_exts).next() {
            return Err(ConfigError::OverlappingExt(ext.clone()));
        }
        Ok(())
    }

    pub fn mapping_for_remote(&self, remote_path: &str) -> Option<&SyncRootMapping> {
        self.mappings
            .iter()
            .filter(|m| m.contains_remote(remote_path))
            .max_by_key(|m| m.remote_root.len())
    }

    pub fn is_transfer_path(&self, remote_path: &str) -> bool {
        self.transfer_roots
            .iter()
            .any(|root| is_under(remote_path, root))
    }
}

/// `true` when `path` equals `root` or lies below it.
pub fn is_under(path: &str, root: &str) -> bool {
    if root == "/" {
        return path.starts_with('/');
    }
    let root = root.trim_end_matches('/');
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn normalize_remote(value: &str) -> String {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parse_mappings(raw: &str, home: &Path) -> Result<Vec<SyncRootMapping>, ConfigError> {
    raw.split([';', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mapping: SyncRootMapping = part.parse()?;
            Ok(SyncRootMapping::new(
                expand_with_home(&mapping.local_root.to_string_lossy(), home),
                mapping.remote_root,
            ))
        })
        .collect()
}

fn ext_set<'a>(exts: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    exts.map(|ext| {
        let ext = ext.trim().to_ascii_lowercase();
        if ext.starts_with('.') {
            ext
        } else {
            format!(".{ext}")
        }
    })
    .filter(|ext| ext.len() > 1)
    .collect()
}

fn read_kinds_env(name: &'static str) -> Result<Option<BTreeSet<LifeEventKind>>, ConfigError> {
    let Some(values) = read_list_env(name) else {
        return Ok(None);
    };
    values
        .into_iter()
        .map(|value| {
            serde_json::from_value::<LifeEventKind>(serde_json::Value::String(value.clone()))
                .ok()
                .filter(|kind| *kind != LifeEventKind::Other)
                .ok_or(ConfigError::InvalidValue { name, value })
        })
        .collect::<Result<BTreeSet<_>, _>>()
        .map(Some)
}

pub(crate) fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_list_env(name: &str) -> Option<Vec<String>> {
    let raw = std::env::var(name).ok()?;
    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Unset or unparsable values fall back to `default`; zero is kept and left
/// to [`SyncConfig::validate`].
pub(crate) fn read_u64_env(name: &str, default: u64) -> u64 {
    parse_u64(std::env::var(name).ok().as_deref(), default)
}

fn parse_u64(raw: Option<&str>, default: u64) -> u64 {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

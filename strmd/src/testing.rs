//! In-memory drive and index fixtures shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;
use sqlx::sqlite::SqlitePoolOptions;
use strm_core::{
    Ancestor, DescendantPage, DownloadUrl, DriveApi, DriveError, EntryKind, LifeCursor, LifeEvent,
    LifeEventKind, ListPage, ROOT_ID, RemoteEntry, RemoteId, ShareRef, WalkedEntry,
};
use url::Url;

use crate::sync::index::PathIndex;

pub(crate) async fn memory_index() -> Arc<PathIndex> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let index = PathIndex::from_pool(pool);
    index.init().await.unwrap();
    Arc::new(index)
}

#[derive(Default)]
struct State {
    entries: BTreeMap<RemoteId, RemoteEntry>,
    events: Vec<LifeEvent>,
    urls: HashMap<String, String>,
    calls: HashMap<&'static str, usize>,
    deleted: Vec<RemoteId>,
    next_id: RemoteId,
    url_expiry: Option<i64>,
    fail_events: bool,
    fail_listing: bool,
}

pub(crate) struct FakeDrive {
    state: Mutex<State>,
}

impl FakeDrive {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 10_000,
                url_expiry: Some(1_700_003_600),
                ..State::default()
            }),
        }
    }

    pub(crate) fn add_dir(&self, id: RemoteId, parent_id: RemoteId, name: &str) {
        self.insert(RemoteEntry {
            id,
            parent_id,
            name: name.into(),
            kind: EntryKind::Dir,
            size: None,
            sha1: None,
            pickcode: None,
            created: Some(1_700_000_000),
            modified: Some(1_700_000_000),
        });
    }

    pub(crate) fn add_file(
        &self,
        id: RemoteId,
        parent_id: RemoteId,
        name: &str,
        size: u64,
        pickcode: &str,
    ) {
        self.insert(RemoteEntry {
            id,
            parent_id,
            name: name.into(),
            kind: EntryKind::File,
            size: Some(size),
            sha1: Some(format!("sha1-{id}")),
            pickcode: Some(pickcode.into()),
            created: Some(1_700_000_000),
            modified: Some(1_700_000_000),
        });
    }

    pub(crate) fn insert(&self, entry: RemoteEntry) {
        self.state.lock().unwrap().entries.insert(entry.id, entry);
    }

    pub(crate) fn remove(&self, id: RemoteId) {
        self.state.lock().unwrap().entries.remove(&id);
    }

    pub(crate) fn rename(&self, id: RemoteId, parent_id: RemoteId, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.parent_id = parent_id;
            entry.name = name.into();
        }
    }

    pub(crate) fn push_event(&self, event: LifeEvent) {
        self.state.lock().unwrap().events.push(event);
    }

    /// Builds an event from the current state of `file_id`.
    pub(crate) fn event_for(
        &self,
        event_id: i64,
        kind: LifeEventKind,
        file_id: RemoteId,
        time: i64,
    ) {
        let entry = self.state.lock().unwrap().entries.get(&file_id).cloned();
        let event = match entry {
            Some(entry) => LifeEvent {
                id: event_id,
                kind,
                file_id,
                parent_id: entry.parent_id,
                name: entry.name,
                is_dir: entry.kind == EntryKind::Dir,
                pickcode: entry.pickcode,
                sha1: entry.sha1,
                size: entry.size,
                time,
            },
            None => LifeEvent {
                id: event_id,
                kind,
                file_id,
                parent_id: ROOT_ID,
                name: String::new(),
                is_dir: false,
                pickcode: None,
                sha1: None,
                size: None,
                time,
            },
        };
        self.push_event(event);
    }

    pub(crate) fn set_url(&self, pickcode: &str, url: &str) {
        self.state
            .lock()
            .unwrap()
            .urls
            .insert(pickcode.into(), url.into());
    }

    pub(crate) fn set_url_expiry(&self, expiry: Option<i64>) {
        self.state.lock().unwrap().url_expiry = expiry;
    }

    pub(crate) fn fail_events(&self, fail: bool) {
        self.state.lock().unwrap().fail_events = fail;
    }

    pub(crate) fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    pub(crate) fn calls(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn deleted(&self) -> Vec<RemoteId> {
        self.state.lock().unwrap().deleted.clone()
    }

    fn count(state: &mut State, name: &'static str) -> usize {
        let slot = state.calls.entry(name).or_default();
        *slot += 1;
        *slot
    }

    fn ancestors(state: &State, id: RemoteId) -> Vec<Ancestor> {
        let mut chain = Vec::new();
        let mut current = state.entries.get(&id).map(|e| e.parent_id);
        while let Some(parent) = current {
            if parent == ROOT_ID {
                break;
            }
            match state.entries.get(&parent) {
                Some(entry) => {
                    chain.push(Ancestor {
                        id: entry.id,
                        name: entry.name.clone(),
                    });
                    current = Some(entry.parent_id);
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    fn walked(state: &State, id: RemoteId) -> Option<WalkedEntry> {
        let entry = state.entries.get(&id)?.clone();
        Some(WalkedEntry {
            ancestors: Self::ancestors(state, id),
            entry,
        })
    }

    fn descendants(state: &State, root: RemoteId) -> Vec<WalkedEntry> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            for entry in state.entries.values().filter(|e| e.parent_id == dir) {
                if entry.is_dir() {
                    stack.push(entry.id);
                }
                if let Some(walked) = Self::walked(state, entry.id) {
                    out.push(walked);
                }
            }
        }
        out.sort_by_key(|w| w.path());
        out
    }

    fn mint(state: &mut State, key: &str) -> Result<DownloadUrl, DriveError> {
        let n = Self::count(state, "mint");
        let raw = match state.urls.get(key) {
            Some(url) => url.clone(),
            None => match state.url_expiry {
                Some(t) => format!("https://cdn.test/{key}/{n}?t={t}"),
                None => format!("https://cdn.test/{key}/{n}"),
            },
        };
        Ok(DownloadUrl {
            url: Url::parse(&raw)?,
            file_name: None,
            size: None,
        })
    }
}

#[async_trait]
impl DriveApi for FakeDrive {
    async fn list_dir(
        &self,
        dir_id: RemoteId,
        offset: u32,
        limit: u32,
    ) -> Result<ListPage, DriveError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "list_dir");
        if state.fail_listing {
            return Err(DriveError::Protocol("listing unavailable".into()));
        }
        let children: Vec<RemoteEntry> = state
            .entries
            .values()
            .filter(|e| e.parent_id == dir_id)
            .cloned()
            .collect();
        let total = children.len() as u32;
        Ok(ListPage {
            items: children
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect(),
            offset,
            total,
        })
    }

    async fn list_descendants(
        &self,
        root_id: RemoteId,
        offset: u32,
        limit: u32,
    ) -> Result<DescendantPage, DriveError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "list_descendants");
        let all = Self::descendants(&state, root_id);
        let total = all.len() as u32;
        Ok(DescendantPage {
            items: all
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect(),
            offset,
            total,
        })
    }

    async fn get_entry(&self, id: RemoteId) -> Result<Option<WalkedEntry>, DriveError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "get_entry");
        Ok(Self::walked(&state, id))
    }

    async fn resolve_path(&self, path: &str) -> Result<Option<RemoteId>, DriveError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "resolve_path");
        if path == "/" {
            return Ok(Some(ROOT_ID));
        }
        Ok(state
            .entries
            .keys()
            .find(|id| Self::walked(&state, **id).is_some_and(|w| w.path() == path))
            .copied())
    }

    async fn export_tree(&self, root_id: RemoteId) -> Result<Vec<String>, DriveError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "export_tree");
        Ok(Self::descendants(&state, root_id)
            .into_iter()
            .map(|w| w.path())
            .collect())
    }

    async fn life_events(
        &self,
        since: LifeCursor,
        limit: u32,
    ) -> Result<Vec<LifeEvent>, DriveError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "life_events");
        if state.fail_events {
            return Err(DriveError::Api {
                status: StatusCode::BAD_GATEWAY,
                body: "feed unavailable".into(),
            });
        }
        let mut events: Vec<LifeEvent> = state
            .events
            .iter()
            .filter(|e| e.cursor() > since)
            .cloned()
            .collect();
        events.sort_by_key(|e| std::cmp::Reverse(e.cursor()));
        events.truncate(limit as usize);
        Ok(events)
    }

    async fn download_url(
        &self,
        pickcode: &str,
        _user_agent: &str,
    ) -> Result<DownloadUrl, DriveError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "download_url");
        Self::mint(&mut state, pickcode)
    }

    async fn share_download_url(
        &self,
        share: &ShareRef,
        _user_agent: &str,
    ) -> Result<DownloadUrl, DriveError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "share_download_url");
        if share.share_code == "expired" {
            return Err(DriveError::ShareExpired("share expired".into()));
        }
        let key = format!("{}-{}", share.share_code, share.file_id);
        Self::mint(&mut state, &key)
    }

    async fn entry_by_pickcode(&self, pickcode: &str) -> Result<RemoteEntry, DriveError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "entry_by_pickcode");
        state
            .entries
            .values()
            .find(|e| e.pickcode.as_deref() == Some(pickcode))
            .cloned()
            .ok_or(DriveError::Api {
                status: StatusCode::NOT_FOUND,
                body: "no such pickcode".into(),
            })
    }

    async fn duplicate(
        &self,
        id: RemoteId,
        target_dir_id: RemoteId,
    ) -> Result<RemoteEntry, DriveError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "duplicate");
        let mut copy = state
            .entries
            .get(&id)
            .cloned()
            .ok_or(DriveError::MissingField("id"))?;
        state.next_id += 1;
        copy.id = state.next_id;
        copy.parent_id = target_dir_id;
        copy.pickcode = Some(format!("DUP{:014}", copy.id));
        state.entries.insert(copy.id, copy.clone());
        Ok(copy)
    }

    async fn delete(&self, ids: &[RemoteId]) -> Result<(), DriveError> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "delete");
        for id in ids {
            state.entries.remove(id);
            state.deleted.push(*id);
        }
        Ok(())
    }
}

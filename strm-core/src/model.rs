use serde::{Deserialize, Serialize};
use url::Url;

/// Remote-assigned identifier. The drive root is always `0`.
pub type RemoteId = i64;

pub const ROOT_ID: RemoteId = 0;

const PICKCODE_LEN: usize = 17;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: RemoteId,
    pub parent_id: RemoteId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub pickcode: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub modified: Option<i64>,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Ancestor {
    pub id: RemoteId,
    pub name: String,
}

/// An entry together with the folders above it, top-level folder first.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct WalkedEntry {
    #[serde(flatten)]
    pub entry: RemoteEntry,
    #[serde(default)]
    pub ancestors: Vec<Ancestor>,
}

impl WalkedEntry {
    pub fn path(&self) -> String {
        let mut path = String::new();
        for ancestor in self.ancestors.iter().filter(|a| a.id != ROOT_ID) {
            path.push('/');
            path.push_str(&ancestor.name);
        }
        path.push('/');
        path.push_str(&self.entry.name);
        path
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListPage {
    pub items: Vec<RemoteEntry>,
    pub offset: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DescendantPage {
    pub items: Vec<WalkedEntry>,
    pub offset: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum LifeEventKind {
    Upload,
    Move,
    Rename,
    Copy,
    ReceiveShare,
    NewFolder,
    Delete,
    Browse,
    Star,
    #[serde(other)]
    Other,
}

impl LifeEventKind {
    pub fn is_creation(self) -> bool {
        matches!(
            self,
            LifeEventKind::Upload
                | LifeEventKind::Move
                | LifeEventKind::Rename
                | LifeEventKind::Copy
                | LifeEventKind::ReceiveShare
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifeEventKind::Upload => "upload",
            LifeEventKind::Move => "move",
            LifeEventKind::Rename => "rename",
            LifeEventKind::Copy => "copy",
            LifeEventKind::ReceiveShare => "receive-share",
            LifeEventKind::NewFolder => "new-folder",
            LifeEventKind::Delete => "delete",
            LifeEventKind::Browse => "browse",
            LifeEventKind::Star => "star",
            LifeEventKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LifeEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: LifeEventKind,
    pub file_id: RemoteId,
    pub parent_id: RemoteId,
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub pickcode: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    pub time: i64,
}

impl LifeEvent {
    pub fn cursor(&self) -> LifeCursor {
        LifeCursor {
            time: self.time,
            id: self.id,
        }
    }

    pub fn to_entry(&self) -> RemoteEntry {
        RemoteEntry {
            id: self.file_id,
            parent_id: self.parent_id,
            name: self.name.clone(),
            kind: if self.is_dir {
                EntryKind::Dir
            } else {
                EntryKind::File
            },
            size: self.size,
            sha1: self.sha1.clone(),
            pickcode: self.pickcode.clone(),
            created: Some(self.time),
            modified: Some(self.time),
        }
    }
}

/// Position in the change feed. Ordered by time, then by event id.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct LifeCursor {
    pub time: i64,
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct ShareRef {
    pub share_code: String,
    pub receive_code: String,
    pub file_id: RemoteId,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadUrl {
    pub url: Url,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl DownloadUrl {
    /// Expiry (unix seconds) carried in the signed URL's `t` parameter.
    pub fn embedded_expiry(&self) -> Option<i64> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == "t")
            .and_then(|(_, value)| value.parse::<i64>().ok())
    }
}

pub fn is_valid_pickcode(pickcode: &str) -> bool {
    pickcode.len() == PICKCODE_LEN && pickcode.chars().all(|c| c.is_ascii_alphanumeric())
}

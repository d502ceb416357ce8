mod client;
mod model;

pub use client::{ApiErrorClass, DriveApi, DriveClient, DriveError};
pub use model::{
    Ancestor, DescendantPage, DownloadUrl, EntryKind, LifeCursor, LifeEvent, LifeEventKind,
    ListPage, ROOT_ID, RemoteEntry, RemoteId, ShareRef, WalkedEntry, is_valid_pickcode,
};

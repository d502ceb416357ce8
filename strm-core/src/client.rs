use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::model::{
    DescendantPage, DownloadUrl, LifeCursor, LifeEvent, ListPage, RemoteEntry, RemoteId,
    ShareRef, WalkedEntry,
};

const DEFAULT_BASE_URL: &str = "https://drive.example.com";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("drive rejected request (errno {code}): {message}")]
    Remote { code: i64, message: String },
    #[error("malformed response: {0}")]
    Protocol(String),
    #[error("response is missing field `{0}`")]
    MissingField(&'static str),
    #[error("share link expired or revoked: {0}")]
    ShareExpired(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Forbidden,
    RateLimit,
    Transient,
    Permanent,
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    /// Repeated 403s are how the drive throttles bulk downloads.
    pub fn is_forbidden(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Forbidden))
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::Auth
    } else if status == StatusCode::FORBIDDEN {
        ApiErrorClass::Forbidden
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Operations the mirror needs from the remote drive.
#[async_trait]
pub trait DriveApi: Send + Sync {
    async fn list_dir(
        &self,
        dir_id: RemoteId,
        offset: u32,
        limit: u32,
    ) -> Result<ListPage, DriveError>;

    /// Every file and folder below `root_id`, each with its ancestor chain.
    async fn list_descendants(
        &self,
        root_id: RemoteId,
        offset: u32,
        limit: u32,
    ) -> Result<DescendantPage, DriveError>;

    async fn get_entry(&self, id: RemoteId) -> Result<Option<WalkedEntry>, DriveError>;

    async fn resolve_path(&self, path: &str) -> Result<Option<RemoteId>, DriveError>;

    /// Flat list of absolute paths below `root_id`, produced server-side.
    async fn export_tree(&self, root_id: RemoteId) -> Result<Vec<String>, DriveError>;

    /// Events newer than `since`, newest first.
    async fn life_events(
        &self,
        since: LifeCursor,
        limit: u32,
    ) -> Result<Vec<LifeEvent>, DriveError>;

    async fn download_url(
        &self,
        pickcode: &str,
        user_agent: &str,
    ) -> Result<DownloadUrl, DriveError>;

    async fn share_download_url(
        &self,
        share: &ShareRef,
        user_agent: &str,
    ) -> Result<DownloadUrl, DriveError>;

    async fn entry_by_pickcode(&self, pickcode: &str) -> Result<RemoteEntry, DriveError>;

    async fn duplicate(
        &self,
        id: RemoteId,
        target_dir_id: RemoteId,
    ) -> Result<RemoteEntry, DriveError>;

    async fn delete(&self, ids: &[RemoteId]) -> Result<(), DriveError>;

    /// Pages through [`DriveApi::list_dir`] until `total` is reached or
    /// `max_pages` pages were read.
    async fn list_dir_all(
        &self,
        dir_id: RemoteId,
        page_size: u32,
        max_pages: u32,
    ) -> Result<Vec<RemoteEntry>, DriveError> {
        let page_size = page_size.max(1);
        let mut offset = 0u32;
        let mut items = Vec::new();
        for _ in 0..max_pages.max(1) {
            let page = self.list_dir(dir_id, offset, page_size).await?;
            let fetched = page.items.len() as u32;
            offset = offset.saturating_add(fetched);
            items.extend(page.items);
            if fetched == 0 || offset >= page.total {
                break;
            }
        }
        Ok(items)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    state: bool,
    #[serde(default)]
    errno: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ResolvedPath {
    #[serde(default)]
    id: Option<RemoteId>,
}

#[derive(Debug, Deserialize)]
struct ExportedTree {
    paths: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CopyRequest {
    id: RemoteId,
    target_dir_id: RemoteId,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    ids: &'a [RemoteId],
}

const ERRNO_SHARE_EXPIRED: i64 = 4100009;

/// HTTP implementation of [`DriveApi`] authenticated with a session cookie.
#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    cookie: String,
}

impl DriveClient {
    pub fn new(cookie: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, cookie)
    }

    pub fn with_base_url(base_url: &str, cookie: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            cookie: cookie.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("Cookie", &self.cookie)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, DriveError> {
        let response = self.authed(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        Self::handle_optional(response)
            .await?
            .ok_or(DriveError::MissingField("data"))
    }

    async fn handle_optional<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Option<T>, DriveError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriveError::Api { status, body });
        }
        let body = response.text().await?;
        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|err| DriveError::Protocol(err.to_string()))?;
        if !envelope.state {
            let code = envelope.errno.unwrap_or(0);
            let message = envelope.error.unwrap_or_default();
            if code == ERRNO_SHARE_EXPIRED {
                return Err(DriveError::ShareExpired(message));
            }
            return Err(DriveError::Remote { code, message });
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl DriveApi for DriveClient {
    async fn list_dir(
        &self,
        dir_id: RemoteId,
        offset: u32,
        limit: u32,
    ) -> Result<ListPage, DriveError> {
        let mut url = self.endpoint("/api/files")?;
        url.query_pairs_mut()
            .append_pair("cid", &dir_id.to_string())
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }

    async fn list_descendants(
        &self,
        root_id: RemoteId,
        offset: u32,
        limit: u32,
    ) -> Result<DescendantPage, DriveError> {
        let mut url = self.endpoint("/api/files/descendants")?;
        url.query_pairs_mut()
            .append_pair("cid", &root_id.to_string())
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }

    async fn get_entry(&self, id: RemoteId) -> Result<Option<WalkedEntry>, DriveError> {
        let url = self.endpoint(&format!("/api/files/{id}"))?;
        let response = self.authed(self.http.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::handle_optional(response).await
    }

    async fn resolve_path(&self, path: &str) -> Result<Option<RemoteId>, DriveError> {
        let mut url = self.endpoint("/api/files/resolve")?;
        url.query_pairs_mut().append_pair("path", path);
        let resolved: Option<ResolvedPath> = {
            let response = self.authed(self.http.get(url)).send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            Self::handle_optional(response).await?
        };
        Ok(resolved.and_then(|r| r.id))
    }

    async fn export_tree(&self, root_id: RemoteId) -> Result<Vec<String>, DriveError> {
        let mut url = self.endpoint("/api/files/export")?;
        url.query_pairs_mut()
            .append_pair("cid", &root_id.to_string());
        let tree: ExportedTree = self.get_json(url).await?;
        Ok(tree.paths)
    }

    async fn life_events(
        &self,
        since: LifeCursor,
        limit: u32,
    ) -> Result<Vec<LifeEvent>, DriveError> {
        let mut url = self.endpoint("/api/life/events")?;
        url.query_pairs_mut()
            .append_pair("since_time", &since.time.to_string())
            .append_pair("since_id", &since.id.to_string())
            .append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }

    async fn download_url(
        &self,
        pickcode: &str,
        user_agent: &str,
    ) -> Result<DownloadUrl, DriveError> {
        let mut url = self.endpoint("/api/download/url")?;
        url.query_pairs_mut().append_pair("pickcode", pickcode);
        let response = self
            .authed(self.http.get(url))
            .header("User-Agent", user_agent)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn share_download_url(
        &self,
        share: &ShareRef,
        user_agent: &str,
    ) -> Result<DownloadUrl, DriveError> {
        let mut url = self.endpoint("/api/share/download/url")?;
        url.query_pairs_mut()
            .append_pair("share_code", &share.share_code)
            .append_pair("receive_code", &share.receive_code)
            .append_pair("file_id", &share.file_id.to_string());
        let response = self
            .authed(self.http.get(url))
            .header("User-Agent", user_agent)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn entry_by_pickcode(&self, pickcode: &str) -> Result<RemoteEntry, DriveError> {
        let mut url = self.endpoint("/api/files/pickcode")?;
        url.query_pairs_mut().append_pair("pickcode", pickcode);
        self.get_json(url).await
    }

    async fn duplicate(
        &self,
        id: RemoteId,
        target_dir_id: RemoteId,
    ) -> Result<RemoteEntry, DriveError> {
        let url = self.endpoint("/api/files/copy")?;
        let response = self
            .authed(self.http.post(url))
            .json(&CopyRequest { id, target_dir_id })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn delete(&self, ids: &[RemoteId]) -> Result<(), DriveError> {
        let url = self.endpoint("/api/files/delete")?;
        let response = self
            .authed(self.http.post(url))
            .json(&DeleteRequest { ids })
            .send()
            .await?;
        let _: Option<serde::de::IgnoredAny> = Self::handle_optional(response).await?;
        Ok(())
    }
}

use std::pin::Pin;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.box.com/2.0";

/// Fields requested for folder listings. Box omits `sha1` and the creation
/// details unless asked for.
const ITEM_FIELDS: &str =
    "type,id,name,size,sha1,modified_at,content_modified_at,created_at,created_by";

#[derive(Debug, Error)]
pub enum BoxError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments: {0}")]
    BaseUrl(String),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

pub type ContentStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

#[derive(Clone)]
pub struct BoxClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl BoxClient {
    pub fn new(token: impl Into<String>) -> Result<Self, BoxError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, BoxError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(BoxError::BaseUrl(base_url.to_string()));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            token: token.into(),
        })
    }

    pub async fn get_current_user(&self) -> Result<BoxUser, BoxError> {
        let mut url = self.endpoint(&["users", "me"])?;
        url.query_pairs_mut().append_pair("fields", "id,name,login");
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        Self::handle_response(response).await
    }

    /// Fetches one page of a folder listing. Pass the previous page's
    /// `next_marker` to continue; `None` starts from the beginning.
    pub async fn list_folder_page(
        &self,
        folder_id: &str,
        marker: Option<&str>,
        limit: u32,
    ) -> Result<FolderItems, BoxError> {
        let mut url = self.endpoint(&["folders", folder_id, "items"])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("fields", ITEM_FIELDS)
                .append_pair("limit", &limit.max(1).to_string())
                .append_pair("usemarker", "true");
            if let Some(marker) = marker.filter(|m| !m.is_empty()) {
                query.append_pair("marker", marker);
            }
        }
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        Self::handle_response(response).await
    }

    /// Opens the content of a file as a byte stream. Box answers with a
    /// redirect to a pre-signed download location which reqwest follows.
    pub async fn download_content(&self, file_id: &str) -> Result<ContentStream, BoxError> {
        let url = self.endpoint(&["files", file_id, "content"])?;
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        let response = Self::check_status(response).await?;
        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(BoxError::from)),
        ))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BoxError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BoxError::BaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BoxError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Err(BoxError::Api {
            status,
            body,
            retry_after,
        })
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BoxError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

impl BoxError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            BoxError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BoxError::Request(err) => err.is_timeout() || err.is_connect() || err.is_body(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            BoxError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(value: &str) -> Option<u64> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value.trim()).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
            .as_secs(),
    )
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BoxUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
}

impl BoxUser {
    /// Display name, falling back to the login.
    pub fn display_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or(self.login.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Folder,
    WebLink,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BoxItem {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub content_modified_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub created_by: Option<BoxUser>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FolderItems {
    pub entries: Vec<BoxItem>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub next_marker: Option<String>,
}

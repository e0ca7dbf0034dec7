use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::RetryPolicy;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RemoteError>> + Send>>;

#[derive(Debug, Error, Clone)]
pub enum RemoteError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("remote transport failed: {message}")]
    Transport {
        message: String,
        retryable: bool,
        /// Server-requested wait before the next request.
        retry_after: Option<Duration>,
    },
    #[error("remote item not found: {0}")]
    NotFound(String),
    #[error("listing cancelled")]
    Cancelled,
}

impl RemoteError {
    pub fn is_auth(&self) -> bool {
        matches!(self, RemoteError::Auth(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transport { retryable: true, .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Transport { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// One file as seen in a listing pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileDescriptor {
    pub remote_id: String,
    /// Relative to the listing root, `/`-separated.
    pub path: String,
    pub size: u64,
    pub content_hash: Option<String>,
    /// Unix seconds.
    pub modified: Option<i64>,
    pub created: Option<Creation>,
}

/// Who uploaded a file and when, as reported by the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Creation {
    /// RFC 3339, offset as given by the remote.
    pub at: Option<String>,
    pub by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub content_hash: Option<String>,
    pub modified: Option<i64>,
    pub created: Option<Creation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEntry {
    File(RemoteFile),
    Folder { id: String, name: String },
}

#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub entries: Vec<RemoteEntry>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<RemotePage, RemoteError>;

    async fn open_read(&self, remote_id: &str) -> Result<ByteStream, RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingFolder {
    id: String,
    prefix: String,
    page_token: Option<String>,
}

/// Restart point for a [`RemoteListing`]. Captures the folders still to
/// visit and the page token of the folder being read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingCursor {
    stack: Vec<PendingFolder>,
}

/// Lazy, depth-first walk over a remote folder tree.
pub struct RemoteListing<'a> {
    remote: &'a dyn RemoteStorage,
    stack: Vec<PendingFolder>,
    buffered: std::collections::VecDeque<RemoteFileDescriptor>,
    extensions: Vec<String>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<'a> RemoteListing<'a> {
    pub fn new(
        remote: &'a dyn RemoteStorage,
        root_folder_id: &str,
        extensions: &[String],
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let root = PendingFolder {
            id: root_folder_id.to_string(),
            prefix: String::new(),
            page_token: None,
        };
        Self::from_stack(remote, vec![root], extensions, retry, cancel)
    }

    pub fn resume(
        remote: &'a dyn RemoteStorage,
        cursor: ListingCursor,
        extensions: &[String],
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self::from_stack(remote, cursor.stack, extensions, retry, cancel)
    }

    fn from_stack(
        remote: &'a dyn RemoteStorage,
        stack: Vec<PendingFolder>,
        extensions: &[String],
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            remote,
            stack,
            buffered: Default::default(),
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            retry,
            cancel,
        }
    }

    /// Position after the last page fetched. Descriptors already buffered
    /// from that page are not part of the cursor.
    pub fn cursor(&self) -> ListingCursor {
        ListingCursor {
            stack: self.stack.clone(),
        }
    }

    pub async fn next(&mut self) -> Result<Option<RemoteFileDescriptor>, RemoteError> {
        loop {
            if let Some(descriptor) = self.buffered.pop_front() {
                return Ok(Some(descriptor));
            }
            let Some(mut folder) = self.stack.pop() else {
                return Ok(None);
            };

            let page = self.fetch_page(&folder).await?;
            let mut subfolders = Vec::new();
            for entry in page.entries {
                match entry {
                    RemoteEntry::File(file) => {
                        if !self.wanted(&file.name) {
                            continue;
                        }
                        self.buffered.push_back(RemoteFileDescriptor {
                            path: join(&folder.prefix, &file.name),
                            remote_id: file.id,
                            size: file.size,
                            content_hash: file.content_hash.filter(|h| !h.trim().is_empty()),
                            modified: file.modified,
                            created: file.created,
                        });
                    }
                    RemoteEntry::Folder { id, name } => subfolders.push(PendingFolder {
                        prefix: join(&folder.prefix, &name),
                        id,
                        page_token: None,
                    }),
                }
            }

            // Sub-folders go on the stack in reverse so they pop in listing order,
            // after the rest of the current folder.
            for sub in subfolders.into_iter().rev() {
                self.stack.push(sub);
            }
            if let Some(token) = page.next_page_token {
                folder.page_token = Some(token);
                self.stack.push(folder);
            }
        }
    }

    pub async fn collect_all(&mut self) -> Result<Vec<RemoteFileDescriptor>, RemoteError> {
        let mut out = Vec::new();
        while let Some(descriptor) = self.next().await? {
            out.push(descriptor);
        }
        Ok(out)
    }

    async fn fetch_page(&self, folder: &PendingFolder) -> Result<RemotePage, RemoteError> {
        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(RemoteError::Cancelled);
            }
            attempts += 1;
            match self
                .remote
                .list_page(&folder.id, folder.page_token.as_deref())
                .await
            {
                Ok(page) => {
                    debug!(
                        folder_id = %folder.id,
                        entries = page.entries.len(),
                        more = page.next_page_token.is_some(),
                        "listing page fetched"
                    );
                    return Ok(page);
                }
                Err(err) if err.is_retryable() => {
                    let Some(delay) = self.retry.delay_with_hint(attempts, err.retry_after()) else {
                        return Err(err);
                    };
                    warn!(folder_id = %folder.id, attempt = attempts, error = %err, "listing page failed, retrying");
                    if !RetryPolicy::wait(delay, &self.cancel).await {
                        return Err(RemoteError::Cancelled);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn wanted(&self, name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let Some((_, ext)) = name.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.extensions.iter().any(|wanted| *wanted == ext)
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use imctransfer_core::{ApiErrorClass, BoxClient, BoxError, BoxItem, ItemKind};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use super::remote::{
    ByteStream, Creation, RemoteEntry, RemoteError, RemoteFile, RemotePage, RemoteStorage,
};

pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// [`RemoteStorage`] backed by the Box.com content API.
pub struct BoxRemote {
    client: BoxClient,
    page_size: u32,
}

impl BoxRemote {
    pub fn new(client: BoxClient, page_size: u32) -> Self {
        Self {
            client,
            page_size: page_size.clamp(1, DEFAULT_PAGE_SIZE),
        }
    }
}

#[async_trait]
impl RemoteStorage for BoxRemote {
    async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<RemotePage, RemoteError> {
        let page = self
            .client
            .list_folder_page(folder_id, page_token, self.page_size)
            .await
            .map_err(|err| map_box_error(err, folder_id))?;

        let entries = page.entries.into_iter().filter_map(map_item).collect();
        Ok(RemotePage {
            entries,
            next_page_token: page.next_marker.filter(|marker| !marker.is_empty()),
        })
    }

    async fn open_read(&self, remote_id: &str) -> Result<ByteStream, RemoteError> {
        let stream = self
            .client
            .download_content(remote_id)
            .await
            .map_err(|err| map_box_error(err, remote_id))?;
        let owned_id = remote_id.to_string();
        Ok(Box::pin(
            stream.map(move |chunk| chunk.map_err(|err| map_box_error(err, &owned_id))),
        ))
    }
}

fn map_item(item: BoxItem) -> Option<RemoteEntry> {
    match item.kind {
        ItemKind::File => {
            let modified = item
                .content_modified_at
                .as_deref()
                .or(item.modified_at.as_deref())
                .and_then(|value| match parse_modified(value) {
                    Ok(ts) => Some(ts),
                    Err(err) => {
                        warn!(remote_id = %item.id, value, error = %err, "unparseable modification time");
                        None
                    }
                });
            let created_by = item
                .created_by
                .as_ref()
                .and_then(|user| user.display_name())
                .map(str::to_string);
            let created = (item.created_at.is_some() || created_by.is_some()).then_some(Creation {
                at: item.created_at,
                by: created_by,
            });
            Some(RemoteEntry::File(RemoteFile {
                id: item.id,
                name: item.name,
                size: item.size.unwrap_or(0),
                content_hash: item.sha1,
                modified,
                created,
            }))
        }
        ItemKind::Folder => Some(RemoteEntry::Folder {
            id: item.id,
            name: item.name,
        }),
        ItemKind::WebLink | ItemKind::Other => None,
    }
}

fn parse_modified(value: &str) -> Result<i64, time::error::Parse> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(parsed.unix_timestamp())
}

fn map_box_error(err: BoxError, target: &str) -> RemoteError {
    match err.classification() {
        Some(ApiErrorClass::Auth) => RemoteError::Auth(err.to_string()),
        Some(ApiErrorClass::Permanent) if is_not_found(&err) => {
            RemoteError::NotFound(target.to_string())
        }
        _ => RemoteError::Transport {
            retryable: err.is_retryable(),
            retry_after: err.retry_after_secs().map(Duration::from_secs),
            message: err.to_string(),
        },
    }
}

fn is_not_found(err: &BoxError) -> bool {
    matches!(err, BoxError::Api { status, .. } if status.as_u16() == 404)
}

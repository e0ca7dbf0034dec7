mod client;

pub use client::{
    ApiErrorClass, BoxClient, BoxError, BoxItem, BoxUser, ContentStream, DEFAULT_BASE_URL,
    FolderItems, ItemKind,
};

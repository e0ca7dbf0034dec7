use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use imctransfer_core::DEFAULT_BASE_URL;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::paths::sample_name;
use super::store::{SyncRecord, SyncStatus};

static ACQUISITION_DATE: LazyLock<Regex> = LazyLock::new(|| {
    // Acquisitions are named with a leading YYYYMMDD date.
    Regex::new(r"^(20\d{6})").expect("static pattern compiles")
});

/// Header of the annotation table, in column order.
pub const COLUMNS: [&str; 9] = [
    "sample_name",
    "mcd_file",
    "created_by",
    "created_at",
    "url",
    "sha1",
    "downloaded",
    "written_to",
    "acquisition_date",
];

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One acquisition known to the remote, as listed in the annotation table.
/// Field order matches [`COLUMNS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotationRow {
    pub sample_name: String,
    pub mcd_file: String,
    pub created_by: Option<String>,
    pub created_at: Option<String>,
    pub url: String,
    pub sha1: Option<String>,
    pub downloaded: bool,
    pub written_to: Option<String>,
    pub acquisition_date: Option<String>,
}

pub fn acquisition_date(sample: &str) -> Option<String> {
    ACQUISITION_DATE
        .captures(sample)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn file_url(remote_id: &str) -> String {
    format!("{DEFAULT_BASE_URL}/files/{remote_id}")
}

/// Rows for every file still present remotely, downloaded or not.
pub fn build_rows(records: &[SyncRecord]) -> Vec<AnnotationRow> {
    let mut rows: Vec<AnnotationRow> = records
        .iter()
        .filter(|record| record.status != SyncStatus::Missing)
        .map(|record| {
            let mcd_file = record
                .path
                .rsplit('/')
                .next()
                .unwrap_or(record.path.as_str())
                .to_string();
            let sample = sample_name(&mcd_file);
            let downloaded = record.status == SyncStatus::Verified;
            AnnotationRow {
                acquisition_date: acquisition_date(&sample),
                sample_name: sample,
                mcd_file,
                created_by: record.created_by.clone(),
                created_at: record.created_at.clone(),
                url: file_url(&record.remote_id),
                sha1: record.content_hash.clone(),
                downloaded,
                written_to: record.local_path.clone().filter(|_| downloaded),
            }
        })
        .collect();

    // Undated samples sort last.
    rows.sort_by(|a, b| {
        (a.acquisition_date.is_none(), &a.acquisition_date, &a.sample_name).cmp(&(
            b.acquisition_date.is_none(),
            &b.acquisition_date,
            &b.sample_name,
        ))
    });
    rows
}

pub fn render_csv(rows: &[AnnotationRow]) -> Result<Vec<u8>, ReportError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(COLUMNS)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.into_inner().map_err(|err| err.into_error().into())
}

/// Writes the table next to `path` and renames it into place. Returns the
/// number of rows.
pub async fn write_report(path: &Path, records: &[SyncRecord]) -> Result<usize, ReportError> {
    let rows = build_rows(records);
    let table = render_csv(&rows)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&table).await?;
    file.sync_all().await?;
    drop(file);
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(rows.len())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const STAGING_SUFFIX: &str = "partial";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// How remote files are laid out under the output root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// Remote relative path, unchanged.
    #[default]
    Mirror,
    /// `<root>/<sample name>/<file name>`, one directory per acquisition.
    PerSample,
}

pub fn local_path_for(root: &Path, remote_path: &str, layout: Layout) -> Result<PathBuf, PathError> {
    let parts = normal_components(remote_path)?;
    let mut out = root.to_path_buf();
    match layout {
        Layout::Mirror => out.extend(parts),
        Layout::PerSample => {
            let file_name = parts.last().ok_or(PathError::Empty)?;
            out.push(sample_name(file_name));
            out.push(file_name);
        }
    }
    Ok(out)
}

/// File stem with spaces replaced, as used for per-sample directories.
pub fn sample_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file_name);
    stem.replace(' ', "_")
}

/// Staging name for a remote id. The id is hex-encoded so distinct ids never
/// share a staging file.
pub fn staging_path_for(staging_dir: &Path, remote_id: &str) -> PathBuf {
    staging_dir.join(format!("{}.{STAGING_SUFFIX}", hex::encode(remote_id)))
}

/// True when one path is equal to or nested inside the other.
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

fn normal_components(remote_path: &str) -> Result<Vec<&str>, PathError> {
    if remote_path.trim().is_empty() {
        return Err(PathError::Empty);
    }

    let mut parts = Vec::new();
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err(PathError::UnsupportedComponent(remote_path.to_string())),
            },
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(remote_path.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts)
}

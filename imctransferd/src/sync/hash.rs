use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::Digest;
use tokio::io::{AsyncRead, AsyncReadExt};

const BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    /// Box.com reports SHA-1 for every file version.
    #[default]
    Sha1,
    Md5,
    Sha256,
}

/// Lowercase hex digest of some content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Compares against a hex digest from elsewhere (remote listing, store).
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn hashes_equal(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

enum Inner {
    Sha1(sha1::Sha1),
    Md5(md5::Context),
    Sha256(sha2::Sha256),
}

/// Incremental hasher fed while bytes stream in.
pub struct ContentHasher {
    inner: Inner,
    bytes: u64,
}

impl ContentHasher {
    pub fn new(kind: HashKind) -> Self {
        let inner = match kind {
            HashKind::Sha1 => Inner::Sha1(sha1::Sha1::new()),
            HashKind::Md5 => Inner::Md5(md5::Context::new()),
            HashKind::Sha256 => Inner::Sha256(sha2::Sha256::new()),
        };
        Self { inner, bytes: 0 }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.bytes = self.bytes.saturating_add(chunk.len() as u64);
        match &mut self.inner {
            Inner::Sha1(h) => h.update(chunk),
            Inner::Md5(ctx) => ctx.consume(chunk),
            Inner::Sha256(h) => h.update(chunk),
        }
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> ContentHash {
        let hex = match self.inner {
            Inner::Sha1(h) => hex::encode(h.finalize()),
            Inner::Md5(ctx) => hex::encode(ctx.compute().0),
            Inner::Sha256(h) => hex::encode(h.finalize()),
        };
        ContentHash(hex)
    }
}

async fn digest_reader<R: AsyncRead + Unpin>(
    kind: HashKind,
    mut reader: R,
) -> io::Result<ContentHash> {
    let mut hasher = ContentHasher::new(kind);
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

pub async fn digest_file(kind: HashKind, path: &Path) -> io::Result<ContentHash> {
    let file = tokio::fs::File::open(path).await?;
    digest_reader(kind, file).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn sha1_of_known_content() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        f.flush().unwrap();

        let hash = digest_file(HashKind::Sha1, f.path()).await.unwrap();
        assert_eq!(hash.as_str(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[tokio::test]
    async fn empty_input_digests() {
        let sha1 = digest_reader(HashKind::Sha1, &b""[..]).await.unwrap();
        let md5 = digest_reader(HashKind::Md5, &b""[..]).await.unwrap();
        let sha256 = digest_reader(HashKind::Sha256, &b""[..]).await.unwrap();
        assert_eq!(sha1.as_str(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(md5.as_str(), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            sha256.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn chunked_updates_match_whole_buffer() {
        let mut hasher = ContentHasher::new(HashKind::Sha1);
        for chunk in [&b"hello "[..], b"wor", b"ld"] {
            hasher.update(chunk);
        }
        let whole = digest_reader(HashKind::Sha1, &b"hello world"[..])
            .await
            .unwrap();
        assert_eq!(hasher.finalize(), whole);
    }

    #[test]
    fn comparison_ignores_case() {
        let mut hasher = ContentHasher::new(HashKind::Sha1);
        hasher.update(b"hello world");
        assert_eq!(hasher.bytes_seen(), 11);
        let hash = hasher.finalize();
        assert!(hash.matches("2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED"));
        assert!(hashes_equal(" abc", "ABC"));
    }
}

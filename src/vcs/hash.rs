//! Content hashing.
//!
//! File hashes are git blob object ids, so a hash computed here always equals
//! what `git hash-object` (or the index, via `git ls-files -s`) reports for
//! the same content. Symlinks hash the link text, as git stores them.
//! Version strings and remote source directory names use truncated SHA-256.

use std::ffi::OsStr;
use std::path::Path;

use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::io::AsyncReadExt;

use crate::error::Result;

/// Version reported for a tree with no files.
pub const NEW_MODULE_VERSION: &str = "v-0000000000";

/// Length of the hex prefix kept for version strings and URL hashes.
const SHORT_HASH_LEN: usize = 10;

const READ_CHUNK: usize = 64 * 1024;

/// Git blob id of `content`.
pub fn hash_blob(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", content.len()).as_bytes());
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Git blob id of the file or symlink at `path`.
///
/// Regular files are streamed, so large files are never fully buffered.
pub async fn hash_object(path: &Path) -> Result<String> {
    let metadata = tokio::fs::symlink_metadata(path).await?;

    if metadata.file_type().is_symlink() {
        let target = tokio::fs::read_link(path).await?;
        return Ok(hash_blob(&os_bytes(target.as_os_str())));
    }

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", metadata.len()).as_bytes());

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Combine several hashes/strings into one `v-` prefixed version string.
pub fn hash_strings<S: AsRef<str>>(values: &[S]) -> String {
    let joined = values
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(".");
    format!("v-{}", short_sha256(joined.as_bytes()))
}

/// Short hash of a remote repository URL, used in cache directory names.
pub fn hash_repo_url(url: &str) -> String {
    short_sha256(url.as_bytes())
}

fn short_sha256(data: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(data));
    digest[..SHORT_HASH_LEN].to_string()
}

#[cfg(unix)]
fn os_bytes(s: &OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    s.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn os_bytes(s: &OsStr) -> Vec<u8> {
    s.to_string_lossy().replace('\\', "/").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_blob_matches_git() {
        // `printf '' | git hash-object --stdin`
        assert_eq!(hash_blob(b""), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
        // `echo hello | git hash-object --stdin`
        assert_eq!(hash_blob(b"hello\n"), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[tokio::test]
    async fn test_hash_object_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("foo.txt");
        std::fs::write(&path, "hello\n").unwrap();
        assert_eq!(
            hash_object(&path).await.unwrap(),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
    }

    #[tokio::test]
    async fn test_hash_object_large_file_streams() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let content: Vec<u8> = (0..(READ_CHUNK * 3 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();
        assert_eq!(hash_object(&path).await.unwrap(), hash_blob(&content));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hash_object_symlink_hashes_target_text() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("target.txt"), "content").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("target.txt", &link).unwrap();
        assert_eq!(hash_object(&link).await.unwrap(), hash_blob(b"target.txt"));
    }

    #[tokio::test]
    async fn test_hash_object_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(hash_object(&dir.path().join("nope")).await.is_err());
    }

    #[test]
    fn test_hash_strings_format() {
        let version = hash_strings(&["a", "b"]);
        assert!(version.starts_with("v-"));
        assert_eq!(version.len(), 2 + SHORT_HASH_LEN);
        assert_eq!(version, hash_strings(&["a".to_string(), "b".to_string()]));
        assert_ne!(version, hash_strings(&["b", "a"]));
    }

    #[test]
    fn test_hash_repo_url() {
        let hash = hash_repo_url("https://github.com/org/repo.git#main");
        assert_eq!(hash.len(), SHORT_HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash, hash_repo_url("https://github.com/org/repo.git#other"));
    }
}

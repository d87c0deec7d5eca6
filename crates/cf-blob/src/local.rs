//! Filesystem-backed [`BlobStore`].
//!
//! Each object lives at `{root}/{key}` with its content type in a sibling
//! `{key}.content-type` file. Writes go to a temporary sibling first and are
//! renamed into place.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use cf_core::config::StorageConfig;
use cf_core::{Error, Result};

use crate::{signing, validate_key, BlobRef, BlobStore, SignedLink};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub struct LocalBlobStore {
    root: PathBuf,
    base_url: String,
    signing_secret: Option<String>,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signing_secret: None,
        }
    }

    pub fn with_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        let store = Self::new(&config.root, &config.base_url);
        match &config.signing_secret {
            Some(secret) => store.with_signing_secret(secret),
            None => store,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check a link produced by [`BlobStore::presign`].
    pub fn verify_link(&self, key: &str, expires: i64, signature: &str) -> bool {
        match &self.signing_secret {
            Some(secret) => signing::verify(secret, key, expires, signature, Utc::now().timestamp()),
            None => false,
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn sidecar(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(".content-type");
        PathBuf::from(s)
    }

    fn staging(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(".partial");
        PathBuf::from(s)
    }

    async fn prepare_parent(path: &Path, key: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(key, e.to_string()))?;
        }
        Ok(())
    }

    async fn finish_write(&self, key: &str, path: &Path, content_type: &str) -> Result<BlobRef> {
        tokio::fs::rename(Self::staging(path), path)
            .await
            .map_err(|e| Error::storage(key, e.to_string()))?;
        tokio::fs::write(Self::sidecar(path), content_type)
            .await
            .map_err(|e| Error::storage(key, e.to_string()))?;
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::storage(key, e.to_string()))?
            .len();

        tracing::debug!(key, size, content_type, "Blob stored");
        Ok(BlobRef {
            key: key.to_string(),
            size,
            content_type: content_type.to_string(),
        })
    }

    fn map_read_err(key: &str, e: std::io::Error) -> Error {
        if e.kind() == ErrorKind::NotFound {
            Error::not_found("blob", key)
        } else {
            Error::storage(key, e.to_string())
        }
    }

    /// Stored content type, falling back to `application/octet-stream`.
    pub async fn content_type(&self, key: &str) -> Result<String> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(Self::sidecar(&path)).await {
            Ok(ct) => Ok(ct),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(DEFAULT_CONTENT_TYPE.to_string()),
            Err(e) => Err(Error::storage(key, e.to_string())),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<BlobRef> {
        let path = self.path_for(key)?;
        Self::prepare_parent(&path, key).await?;
        tokio::fs::write(Self::staging(&path), &data)
            .await
            .map_err(|e| Error::storage(key, e.to_string()))?;
        self.finish_write(key, &path, content_type).await
    }

    async fn put_file(&self, key: &str, src: &Path, content_type: &str) -> Result<BlobRef> {
        let path = self.path_for(key)?;
        Self::prepare_parent(&path, key).await?;
        tokio::fs::copy(src, Self::staging(&path))
            .await
            .map_err(|e| Error::storage(key, format!("copy from {}: {e}", src.display())))?;
        self.finish_write(key, &path, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::map_read_err(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn download_to(&self, key: &str, dest: &Path) -> Result<u64> {
        let path = self.path_for(key)?;
        tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::map_read_err(key, e))?;
        tokio::fs::copy(&path, dest)
            .await
            .map_err(|e| Error::storage(key, format!("copy to {}: {e}", dest.display())))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::storage(key, e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(Self::sidecar(&path)).await;
                tracing::debug!(key, "Blob deleted");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::storage(key, e.to_string())),
        }
    }

    fn presign(&self, key: &str, ttl: Duration) -> Result<SignedLink> {
        validate_key(key)?;
        let secret = self
            .signing_secret
            .as_deref()
            .ok_or_else(|| Error::Config("storage.signing_secret is not set".into()))?;

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Validation(format!("link ttl out of range: {e}")))?;
        let expires_at = Utc::now() + ttl;
        let expires = expires_at.timestamp();
        let sig = signing::sign(secret, key, expires)?;

        Ok(SignedLink {
            url: format!("{}/{key}?expires={expires}&sig={sig}", self.base_url),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> LocalBlobStore {
        LocalBlobStore::new(dir.path(), "http://localhost:8080/blobs/").with_signing_secret("k")
    }

    #[tokio::test]
    async fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        let r = s.put("raw/a.mp4", Bytes::from_static(b"video"), "video/mp4").await.unwrap();
        assert_eq!(r.size, 5);
        assert!(s.exists("raw/a.mp4").await.unwrap());
        assert_eq!(s.get("raw/a.mp4").await.unwrap(), Bytes::from_static(b"video"));
        assert_eq!(s.content_type("raw/a.mp4").await.unwrap(), "video/mp4");

        assert!(s.delete("raw/a.mp4").await.unwrap());
        assert!(!s.delete("raw/a.mp4").await.unwrap());
        assert!(!s.exists("raw/a.mp4").await.unwrap());
    }

    #[tokio::test]
    async fn put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.put("processed/a.mp4", Bytes::from_static(b"partial-garbage"), "video/mp4")
            .await
            .unwrap();
        s.put("processed/a.mp4", Bytes::from_static(b"full"), "video/mp4")
            .await
            .unwrap();
        assert_eq!(s.get("processed/a.mp4").await.unwrap(), Bytes::from_static(b"full"));
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        assert!(matches!(s.get("raw/nope.mp4").await.unwrap_err(), Error::NotFound { .. }));

        let dest = dir.path().join("out.mp4");
        assert!(matches!(
            s.download_to("raw/nope.mp4", &dest).await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn put_file_and_download_to() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let src = dir.path().join("input.bin");
        std::fs::write(&src, b"abc").unwrap();

        s.put_file("processed/x_720p.mp4", &src, "video/mp4").await.unwrap();
        let dest = dir.path().join("copy.bin");
        assert_eq!(s.download_to("processed/x_720p.mp4", &dest).await.unwrap(), 3);
        assert_eq!(std::fs::read(dest).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let err = s
            .put("../escape", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn presign_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let link = s.presign("processed/a_720p.mp4", Duration::from_secs(300)).unwrap();
        assert!(link
            .url
            .starts_with("http://localhost:8080/blobs/processed/a_720p.mp4?expires="));

        let (_, query) = link.url.split_once('?').unwrap();
        let mut expires = 0;
        let mut sig = "";
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("expires", v) => expires = v.parse().unwrap(),
                ("sig", v) => sig = v,
                _ => {}
            }
        }
        assert_eq!(expires, link.expires_at.timestamp());
        assert!(s.verify_link("processed/a_720p.mp4", expires, sig));
        assert!(!s.verify_link("raw/a.mp4", expires, sig));
    }

    #[test]
    fn presign_requires_secret() {
        let dir = tempfile::tempdir().unwrap();
        let s = LocalBlobStore::new(dir.path(), "http://x");
        assert!(matches!(
            s.presign("raw/a.mp4", Duration::from_secs(1)).unwrap_err(),
            Error::Config(_)
        ));
    }
}

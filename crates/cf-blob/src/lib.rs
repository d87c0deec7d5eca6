//! cf-blob: object storage for source videos and transcoded outputs.
//!
//! Objects are addressed by slash-separated keys (`raw/{id}.mp4`,
//! `processed/{id}_720p.mp4`). Writes replace any existing object under the
//! same key, so a retried upload simply overwrites a partial one.

pub mod local;
pub mod signing;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cf_core::{Error, Result};

pub use local::LocalBlobStore;

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub key: String,
    pub size: u64,
    pub content_type: String,
}

/// A time-limited download link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedLink {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, replacing any existing object.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<BlobRef>;

    /// Store the contents of a local file under `key`.
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<BlobRef>;

    /// Read an object fully. Missing objects are [`Error::NotFound`].
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Copy an object to a local file, returning the byte count.
    async fn download_to(&self, key: &str, dest: &Path) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove an object. Returns `false` if it was not there.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Produce a signed link valid for `ttl`.
    fn presign(&self, key: &str, ttl: Duration) -> Result<SignedLink>;
}

/// Reject keys that are empty, absolute, or try to escape the store.
pub fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(Error::Validation(format!("invalid blob key: {key:?}")));
    }
    Ok(())
}

//! Runtime transcode settings consulted before every job.
//!
//! A missing, unreadable, or nonsensical source never fails a job: the
//! worker logs a warning and uses the configured default preset.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cf_av::Profile;
use cf_core::{Error, Result};

/// Settings served by a [`ConfigSource`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub transcode_preset: Option<String>,
    pub api_base_url: Option<String>,
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load_config(&self) -> Result<RemoteConfig>;
}

/// Reads a JSON file on every call so edits apply to the next job.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load_config(&self) -> Result<RemoteConfig> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", self.path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", self.path.display())))
    }
}

/// Fixed settings.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    config: RemoteConfig,
}

impl StaticConfigSource {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    pub fn with_preset(preset: impl Into<String>) -> Self {
        Self::new(RemoteConfig {
            transcode_preset: Some(preset.into()),
            api_base_url: None,
        })
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load_config(&self) -> Result<RemoteConfig> {
        Ok(self.config.clone())
    }
}

/// Pick the preset for the next job.
///
/// `default_preset` is used when the source fails, names no preset, or names
/// one the engine does not know. An unknown default falls back to 720p.
pub async fn resolve_profile(source: &dyn ConfigSource, default_preset: &str) -> Profile {
    let fallback = default_preset.parse::<Profile>().unwrap_or_else(|_| {
        tracing::warn!(preset = default_preset, "Unknown default preset; using 720p");
        Profile::P720
    });

    let remote = match source.load_config().await {
        Ok(remote) => remote,
        Err(e) => {
            tracing::warn!(fallback = %fallback, "Config source unavailable: {e}");
            return fallback;
        }
    };

    match remote.transcode_preset.as_deref() {
        Some(name) => name.parse().unwrap_or_else(|_| {
            tracing::warn!(preset = name, fallback = %fallback, "Config source named unknown preset");
            fallback
        }),
        None => fallback,
    }
}

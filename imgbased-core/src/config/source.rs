use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use super::Config;
use crate::fs::read_optional;

pub const VENDOR_CONFIG_DEFAULT: &str = "/usr/share/imgbased/imgbased.conf";
pub const CONFIG_DIR_DEFAULT: &str = "/etc";

#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn source_debug_string(&self) -> String;

    async fn get_config(&self) -> Result<Config>;
}

/// Reads the vendor file, the sorted drop-ins in `<dir>/imgbased.conf.d/` and the user file
/// `<dir>/imgbased.conf`, in that order.
pub struct FileSystemConfigSource {
    vendor_config: PathBuf,
    config_dir: PathBuf,
}

impl FileSystemConfigSource {
    pub fn new(vendor_config: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            vendor_config: vendor_config.into(),
            config_dir: config_dir.into(),
        }
    }

    pub fn new_with_default_paths() -> Self {
        Self::new(VENDOR_CONFIG_DEFAULT, CONFIG_DIR_DEFAULT)
    }

    pub fn with_config_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self::new(VENDOR_CONFIG_DEFAULT, config_dir)
    }

    async fn dropins(&self) -> Result<Vec<PathBuf>> {
        let dir = self.config_dir.join("imgbased.conf.d");
        if !dir.is_dir() {
            tracing::debug!("Drop-in directory not found, skip: {dir:?}");
            return Ok(vec![]);
        }

        let mut paths = vec![];
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to list {dir:?}"))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "conf") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn load(path: &Path) -> Result<Option<(String, String)>> {
        tracing::debug!("Loading config from: {path:?}");
        let content = read_optional(path).await?;
        if content.is_none() {
            tracing::debug!("Config not found, skip: {path:?}");
        }
        Ok(content.map(|content| (path.display().to_string(), content)))
    }
}

#[async_trait]
impl ConfigSource for FileSystemConfigSource {
    fn source_debug_string(&self) -> String {
        format!(
            "filesystem: {:?}, {:?}",
            self.vendor_config, self.config_dir
        )
    }

    async fn get_config(&self) -> Result<Config> {
        let mut paths = vec![self.vendor_config.clone()];
        paths.extend(self.dropins().await?);
        paths.push(self.config_dir.join("imgbased.conf"));

        let mut layers = vec![];
        for path in &paths {
            if let Some(layer) = Self::load(path).await? {
                layers.push(layer);
            }
        }
        Config::from_layers(layers)
    }
}

/// Configuration held in memory, used by tests and for `--config` overrides.
pub struct InMemoryConfigSource {
    content: String,
}

impl InMemoryConfigSource {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    fn source_debug_string(&self) -> String {
        "in-memory".to_owned()
    }

    async fn get_config(&self) -> Result<Config> {
        Config::from_layers([("in-memory", self.content.clone())])
    }
}

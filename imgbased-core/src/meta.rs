use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};

use crate::{fs, naming::Nvr, runner::Runner};

pub const META_DIR: &str = "usr/share/imgbased/build/meta";

const KNOWN_KEYS: &[&str] = &["nvr"];

/// Key/value store shipped inside an image tree, one file per key.
pub struct BuildMetadata {
    dir: PathBuf,
}

impl BuildMetadata {
    /// Metadata of the image tree rooted at `root`.
    pub fn at(root: impl AsRef<Path>) -> Self {
        Self {
            dir: root.as_ref().join(META_DIR),
        }
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        if !KNOWN_KEYS.contains(&key) {
            bail!("Unknown build metadata key {key:?}");
        }
        Ok(self.dir.join(key))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key)?;
        Ok(fs::read_optional(&path)
            .await?
            .map(|value| value.trim_end().to_owned())
            .filter(|value| !value.is_empty()))
    }

    pub async fn set(&self, runner: &Runner, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key)?;
        fs::write_file(runner, &path, value)
            .await
            .with_context(|| format!("Failed to store build metadata {key}"))
    }

    pub async fn nvr(&self) -> Result<Option<Nvr>> {
        self.get("nvr")
            .await?
            .map(|value| value.parse::<Nvr>())
            .transpose()
            .context("Build metadata carries an invalid nvr")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nvr_round_trip() -> Result<()> {
        let root = tempfile::tempdir()?;
        let meta = BuildMetadata::at(root.path());
        assert_eq!(meta.nvr().await?, None);

        meta.set(&Runner::system(false), "nvr", "Image-2.0-0").await?;
        assert_eq!(meta.nvr().await?, Some("Image-2.0-0".parse()?));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trailing_newline_is_ignored() -> Result<()> {
        let root = tempfile::tempdir()?;
        let dir = root.path().join(META_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("nvr"), "Image-2.0-0\n").await?;

        let meta = BuildMetadata::at(root.path());
        assert_eq!(meta.get("nvr").await?.as_deref(), Some("Image-2.0-0"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_key() {
        let meta = BuildMetadata::at("/nonexistent");
        assert!(meta.get("arch").await.is_err());
    }
}

use std::{
    future::Future,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _, Result};

/// Keeps a copy of a bootloader config file while a mutating call runs, and puts it back when
/// the call failed or left the file empty.
pub struct SafeWrite {
    path: PathBuf,
    saved: Option<Vec<u8>>,
}

impl SafeWrite {
    pub async fn snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let saved = match tokio::fs::read(&path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to snapshot {path:?}"));
            }
        };
        Ok(Self { path, saved })
    }

    pub async fn guarded<F, T>(path: impl AsRef<Path>, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guard = Self::snapshot(path).await?;
        let result = f.await;
        guard.finish(result).await
    }

    async fn finish<T>(self, result: Result<T>) -> Result<T> {
        let Some(saved) = &self.saved else {
            return result;
        };

        let is_empty = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len() == 0)
            .unwrap_or(true);

        match result {
            Err(error) => {
                tracing::warn!("Restoring {:?} after a failed write", self.path);
                self.restore(saved).await?;
                Err(error)
            }
            Ok(_) if is_empty && !saved.is_empty() => {
                tracing::warn!("{:?} is empty after the write, restoring it", self.path);
                self.restore(saved).await?;
                bail!("Write to {:?} left the file empty", self.path)
            }
            Ok(value) => Ok(value),
        }
    }

    async fn restore(&self, saved: &[u8]) -> Result<()> {
        tokio::fs::write(&self.path, saved)
            .await
            .with_context(|| format!("Failed to restore {:?}", self.path))
    }
}

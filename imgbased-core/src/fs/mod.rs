pub mod mkfs;
pub mod mount;
pub mod sync;

use std::path::Path;

use anyhow::{Context as _, Result};

use crate::runner::Runner;

/// Write a host file unless the runner is in dry-run mode.
pub async fn write_file(
    runner: &Runner,
    path: impl AsRef<Path>,
    content: impl AsRef<[u8]>,
) -> Result<()> {
    let path = path.as_ref();
    if runner.is_dry_run() {
        tracing::info!("(dry-run) write {path:?}");
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {parent:?}"))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {path:?}"))
}

pub async fn copy_file(
    runner: &Runner,
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if runner.is_dry_run() {
        tracing::info!("(dry-run) copy {src:?} to {dst:?}");
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {parent:?}"))?;
    }
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("Failed to copy {src:?} to {dst:?}"))?;
    Ok(())
}

/// Remove a file or a directory tree. Missing paths are not an error.
pub async fn remove_path(runner: &Runner, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if runner.is_dry_run() {
        tracing::info!("(dry-run) remove {path:?}");
        return Ok(());
    }
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    result.with_context(|| format!("Failed to remove {path:?}"))
}

/// Read a file, `None` if it does not exist.
pub async fn read_optional(path: impl AsRef<Path>) -> Result<Option<String>> {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {path:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dry_run_leaves_files_alone() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Runner::system(true);
        let file = dir.path().join("boot/entry.conf");

        write_file(&runner, &file, "title x").await?;
        assert!(!file.exists());

        tokio::fs::write(dir.path().join("keep"), "x").await?;
        remove_path(&runner, dir.path().join("keep")).await?;
        assert!(dir.path().join("keep").exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_copy_remove() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Runner::system(false);

        let src = dir.path().join("a/vmlinuz-5.14");
        write_file(&runner, &src, "kernel").await?;
        let dst = dir.path().join("boot/Image-1.0-0+1/vmlinuz-5.14");
        copy_file(&runner, &src, &dst).await?;
        assert_eq!(read_optional(&dst).await?.as_deref(), Some("kernel"));

        remove_path(&runner, dir.path().join("boot")).await?;
        assert_eq!(read_optional(&dst).await?, None);
        remove_path(&runner, dir.path().join("boot")).await?;
        Ok(())
    }
}

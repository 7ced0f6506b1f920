use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tempfile::TempDir;

use crate::{
    async_defer,
    runner::{Invocation, Runner},
};

/// Source device of the filesystem mounted at `target`.
pub async fn findmnt_source(runner: &Runner, target: impl AsRef<Path>) -> Result<String> {
    let target = target.as_ref();
    runner
        .run(
            Invocation::new("findmnt")
                .args(["-n", "-o", "SOURCE"])
                .arg(target)
                .read_only(),
        )
        .await
        .with_context(|| format!("Failed to find the source of mount point {target:?}"))
}

pub async fn findmnt_options(runner: &Runner, target: impl AsRef<Path>) -> Result<Vec<String>> {
    let target = target.as_ref();
    let options = runner
        .run(
            Invocation::new("findmnt")
                .args(["-n", "-o", "OPTIONS"])
                .arg(target)
                .read_only(),
        )
        .await
        .with_context(|| format!("Failed to read mount options of {target:?}"))?;
    Ok(options.split(',').map(|o| o.trim().to_owned()).collect())
}

pub async fn is_mountpoint(runner: &Runner, path: impl AsRef<Path>) -> Result<bool> {
    let output = runner
        .run_unchecked(
            Invocation::new("findmnt")
                .args(["-n", "-o", "SOURCE"])
                .arg(path.as_ref())
                .read_only(),
        )
        .await?;
    Ok(output.code == Some(0) && !output.stdout_text().is_empty())
}

/// A filesystem mounted on a private temporary directory, unmounted when dropped.
///
/// Read-only mounts leave host state untouched, so they also happen in dry-run mode and let the
/// caller inspect the tree.
pub struct Mounted {
    runner: Runner,
    mount_dir: TempDir,
    source: PathBuf,
    read_only: bool,
}

impl Mounted {
    pub async fn mount(runner: &Runner, source: impl AsRef<Path>) -> Result<Self> {
        Self::mount_with_options(runner, source, &[]).await
    }

    pub async fn mount_read_only(runner: &Runner, source: impl AsRef<Path>) -> Result<Self> {
        Self::mount_with_options(runner, source, &["ro"]).await
    }

    pub async fn mount_with_options(
        runner: &Runner,
        source: impl AsRef<Path>,
        options: &[&str],
    ) -> Result<Self> {
        let source = source.as_ref();

        let mount_dir = tempfile::Builder::new()
            .prefix("imgbased-mount-")
            .tempdir()?;
        let mount_point = mount_dir.path();

        let read_only = options.contains(&"ro");
        let mut invocation = Invocation::new("mount");
        if !options.is_empty() {
            invocation = invocation.args(["-o", &options.join(",")]);
        }
        if read_only {
            invocation = invocation.read_only();
        }
        runner
            .run(invocation.arg(source).arg(mount_point))
            .await
            .with_context(|| format!("Failed to mount {source:?}"))?;
        tracing::debug!("Mounted {source:?} on {mount_point:?}");

        Ok(Self {
            runner: runner.clone(),
            mount_dir,
            source: source.to_path_buf(),
            read_only,
        })
    }

    pub fn mount_point(&self) -> &Path {
        self.mount_dir.path()
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Resolve an absolute path from inside the mounted tree.
    pub fn join(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.mount_point()
            .join(path.strip_prefix("/").unwrap_or(path))
    }
}

impl Drop for Mounted {
    fn drop(&mut self) {
        async_defer! {
            async {
                let mount_point = self.mount_dir.path();
                let mut umount = Invocation::new("umount").arg(mount_point);
                if self.read_only {
                    umount = umount.read_only();
                }
                let result = self
                    .runner
                    .run(umount)
                    .await
                    .with_context(|| format!("Failed to umount {:?} from {:?}", self.source, mount_point));
                if let Err(error) = &result {
                    tracing::error!("{error:#}");
                }
                result
            }
        }
    }
}

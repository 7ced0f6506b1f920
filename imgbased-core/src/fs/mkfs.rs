use std::path::Path;

use anyhow::{bail, Context as _, Result};
use strum::{Display, EnumString};

use crate::{
    error::Error,
    runner::{Invocation, Runner},
};

/// Filesystems a base or a per-path volume can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FsKind {
    Ext4,
    Xfs,
}

impl FsKind {
    /// Detect the filesystem on `device` via `blkid`.
    pub async fn detect(runner: &Runner, device: impl AsRef<Path>) -> Result<Self> {
        let device = device.as_ref();
        let kind = blkid(runner, device, "TYPE").await?;
        kind.parse::<FsKind>()
            .map_err(|_| Error::FilesystemNotSupported(kind.clone()).into())
    }

    pub async fn mkfs(&self, runner: &Runner, device: impl AsRef<Path>) -> Result<()> {
        let device = device.as_ref();
        let invocation = match self {
            FsKind::Ext4 => Invocation::new("mkfs.ext4").args(["-q", "-F", "-E", "discard"]),
            FsKind::Xfs => Invocation::new("mkfs.xfs").args(["-f", "-K"]),
        };
        runner
            .run(invocation.arg(device))
            .await
            .with_context(|| format!("Failed to create {self} filesystem on {device:?}"))?;
        Ok(())
    }

    /// Give the filesystem on a snapshot a fresh UUID so it does not clash with its origin.
    pub async fn randomize_uuid(&self, runner: &Runner, device: impl AsRef<Path>) -> Result<()> {
        let device = device.as_ref();
        match self {
            FsKind::Ext4 => {
                // tune2fs refuses to change the UUID of an unchecked filesystem
                runner
                    .call("e2fsck", [Path::new("-y"), Path::new("-f"), device])
                    .await
                    .with_context(|| format!("Failed to check filesystem on {device:?}"))?;
                runner
                    .call("tune2fs", [Path::new("-U"), Path::new("random"), device])
                    .await
            }
            FsKind::Xfs => {
                runner
                    .call("xfs_admin", [Path::new("-U"), Path::new("generate"), device])
                    .await
            }
        }
        .with_context(|| format!("Failed to randomize filesystem UUID on {device:?}"))?;
        Ok(())
    }
}

pub async fn blkid(runner: &Runner, device: impl AsRef<Path>, tag: &str) -> Result<String> {
    let device = device.as_ref();
    let value = runner
        .run(
            Invocation::new("blkid")
                .args(["-o", "value", "-s", tag])
                .arg(device)
                .read_only(),
        )
        .await
        .with_context(|| format!("Failed to read {tag} of {device:?}"))?;
    if value.is_empty() {
        bail!("No {tag} found on {device:?}");
    }
    Ok(value)
}

pub async fn uuid(runner: &Runner, device: impl AsRef<Path>) -> Result<String> {
    blkid(runner, device, "UUID").await
}

use std::path::Path;

use anyhow::{Context as _, Result};

use crate::runner::{Invocation, Runner};

/// Archive flags which keep SELinux labels, ACLs and extended attributes.
const TAR_FLAGS: &[&str] = &["--selinux", "--acls", "--xattrs"];

/// rsync flags which keep permissions, owners, ACLs, xattrs, times, links and devices, and stay
/// on one filesystem.
const RSYNC_FLAGS: &str = "-pogAXtlHrDx";

pub(crate) fn quote(path: &Path) -> Result<String> {
    let path = path.to_string_lossy();
    shlex::try_quote(&path)
        .map(|q| q.into_owned())
        .with_context(|| format!("Cannot quote path {path:?} for the shell"))
}

/// Copy the tree under `src` into `dst` through a tar pipeline.
pub async fn tar_copy(
    runner: &Runner,
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    let flags = TAR_FLAGS.join(" ");
    let script = format!(
        "set -o pipefail; tar -C {} -cf - {flags} . | tar -C {} -xf - {flags}",
        quote(src)?,
        quote(dst)?,
    );

    runner
        .run(Invocation::new("bash").args(["-c", &script]))
        .await
        .with_context(|| format!("Failed to copy tree from {src:?} to {dst:?}"))?;
    Ok(())
}

/// Run rsync from `src` to `dst`. A trailing slash on `src` copies its content rather than the
/// directory itself.
pub async fn rsync(
    runner: &Runner,
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    excludes: &[&str],
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());

    let mut invocation = Invocation::new("rsync").arg(RSYNC_FLAGS);
    for exclude in excludes {
        invocation = invocation.arg(format!("--exclude={exclude}"));
    }
    runner
        .run(invocation.arg(src).arg(dst))
        .await
        .with_context(|| format!("Failed to rsync {src:?} to {dst:?}"))?;
    Ok(())
}

//! Work left for the first boot of a freshly migrated layer.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use futures::{future::BoxFuture, FutureExt as _};

use crate::{
    fs::remove_path,
    imgbase::Imgbase,
    migrate::FIRSTBOOT_MARKER,
    rpmdb::{RpmDb, ScriptKind},
    runner::Invocation,
};

fn marker(imgbase: &Imgbase) -> PathBuf {
    imgbase.paths().root.join(FIRSTBOOT_MARKER)
}

pub fn is_pending(imgbase: &Imgbase) -> bool {
    marker(imgbase).exists()
}

async fn relabel(imgbase: &Imgbase) -> Result<()> {
    let runner = imgbase.runner();
    let mode = runner
        .run(Invocation::new("getenforce").read_only())
        .await
        .unwrap_or_default();
    if mode.trim() == "Disabled" {
        tracing::info!("SELinux is disabled, not relabeling");
        return Ok(());
    }

    let root = &imgbase.paths().root;
    tracing::info!("Relabeling /etc and /var");
    runner
        .run(
            Invocation::new("restorecon")
                .arg("-Rv")
                .arg(root.join("etc"))
                .arg(root.join("var")),
        )
        .await
        .context("Failed to relabel")?;
    Ok(())
}

async fn replay_post(imgbase: &Imgbase) -> Result<()> {
    let packages = imgbase.config().replay_post();
    if packages.is_empty() {
        return Ok(());
    }

    let runner = imgbase.runner();
    let rpmdb = RpmDb::at(runner, &imgbase.paths().root);
    let installed = rpmdb.installed().await?;
    for package in packages.iter().filter(|p| installed.contains(p)) {
        let Some(script) = rpmdb.script_of(package, ScriptKind::Post).await? else {
            tracing::debug!("{package} has no %post");
            continue;
        };
        tracing::info!("Replaying %post of {package}");
        runner
            .run(Invocation::new("sh").arg("-c").arg(script))
            .await
            .with_context(|| format!("Failed to replay %post of {package}"))?;
    }
    Ok(())
}

/// Run the first boot jobs if the marker is present. All jobs run to completion; the first error
/// is returned and the marker kept for another attempt.
pub async fn firstboot(imgbase: &Imgbase) -> Result<bool> {
    if !is_pending(imgbase) {
        tracing::debug!("No first boot marker");
        return Ok(false);
    }

    let jobs: Vec<BoxFuture<'_, Result<()>>> =
        vec![relabel(imgbase).boxed(), replay_post(imgbase).boxed()];
    let mut first_error = None;
    for result in futures::future::join_all(jobs).await {
        if let Err(error) = result {
            tracing::error!("First boot job failed: {error:#}");
            first_error.get_or_insert(error);
        }
    }
    if let Some(error) = first_error {
        return Err(error);
    }

    remove_path(imgbase.runner(), marker(imgbase)).await?;
    tracing::info!("First boot done");
    Ok(true)
}

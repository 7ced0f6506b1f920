use anyhow::{bail, Context as _, Result};

use crate::{
    error::Error,
    imgbase::Imgbase,
    naming::{Layer, Nvr},
};

/// Make an earlier layer the default boot entry. Nothing is removed, the switch happens on the
/// next reboot.
///
/// Without `target` the layer before the running one is chosen. With a target base, its latest
/// layer is chosen.
pub async fn rollback(imgbase: &Imgbase, target: Option<&Nvr>) -> Result<Layer> {
    let layout = imgbase.layout();
    let tree = layout.tree().await?;
    let layers = tree.layers();
    if layers.len() < 2 {
        bail!(Error::RollbackFailed(format!(
            "at least two layers are needed, found {}",
            layers.len()
        )));
    }

    let current = layout.current_layer().await?;
    let dst = match target {
        Some(nvr) => tree
            .base(nvr)
            .and_then(|base| base.latest_layer())
            .cloned()
            .ok_or_else(|| Error::RollbackFailed(format!("{nvr} has no layer to roll back to")))?,
        None => tree
            .layer_before(&current)
            .map_err(|e| Error::RollbackFailed(format!("nothing before {current}: {e:#}")))?,
    };
    if dst == current {
        bail!(Error::RollbackFailed(format!("{dst} is already running")));
    }

    tracing::info!("Rolling back from {current} to {dst}");
    imgbase
        .bootloader()
        .set_default(&dst)
        .await
        .with_context(|| format!("Failed to roll back to {dst}"))?;
    tracing::info!("{dst} boots on the next reboot");
    Ok(dst)
}

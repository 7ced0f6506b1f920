//! Retention of bases.

use anyhow::{bail, Result};

use crate::{
    error::Error,
    hooks::Event,
    imgbase::Imgbase,
    naming::{Base, Nvr},
};

/// Bases to free so that at most `keep` remain, never touching `running` or `new`.
///
/// `bases` is expected in layout order, oldest first.
pub fn select_bases_to_free(
    bases: &[Base],
    running: Option<&Nvr>,
    new: Option<&Nvr>,
    keep: usize,
) -> Vec<Base> {
    let keep = keep.max(1);
    let must_keep = |base: &Base| Some(&base.nvr) == running || Some(&base.nvr) == new;

    let mut kept = bases.iter().filter(|b| must_keep(b)).count();
    let mut free = vec![];
    for base in bases.iter().rev().filter(|b| !must_keep(b)) {
        if kept < keep {
            kept += 1;
        } else {
            free.push(base.clone());
        }
    }
    free.reverse();
    free
}

/// Remove a base together with its layers and their boot entries.
pub async fn free_base(imgbase: &Imgbase, base: &Base) -> Result<()> {
    let layout = imgbase.layout();
    if let Ok(current) = layout.current_layer().await {
        if current.nvr == base.nvr {
            bail!("Refusing to remove the running base {base}");
        }
    }

    tracing::info!("Freeing base {base}");
    imgbase
        .emit(Event::PreBaseRemoved {
            base: base.to_string(),
        })
        .await?;
    for layer in base.layers.iter().rev() {
        layout.remove_layer(layer).await?;
    }
    let lv = layout.lv_of(base).await?;
    imgbase.lvm().remove(&lv).await?;
    imgbase
        .emit(Event::BaseRemoved {
            base: base.to_string(),
        })
        .await
}

/// Free every base beyond the configured retention. `new` is the base just installed.
///
/// All removals are attempted; failures are collected into a single [`Error::GcFailed`].
pub async fn collect(imgbase: &Imgbase, new: Option<&Nvr>) -> Result<Vec<Base>> {
    let layout = imgbase.layout();
    let bases = layout.bases().await?;
    let running = layout.current_layer().await.ok().map(|layer| layer.nvr);
    let keep = imgbase.config().images_to_keep();

    let to_free = select_bases_to_free(&bases, running.as_ref(), new, keep);
    if to_free.is_empty() {
        tracing::debug!("Nothing to free, {} bases within retention {keep}", bases.len());
        return Ok(vec![]);
    }

    let mut failed = vec![];
    for base in &to_free {
        if let Err(error) = free_base(imgbase, base).await {
            tracing::error!("Failed to free base {base}: {error:#}");
            failed.push(base.to_string());
        }
    }
    if !failed.is_empty() {
        bail!(Error::GcFailed { failed });
    }
    Ok(to_free)
}

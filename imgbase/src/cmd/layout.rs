use std::fmt::Write as _;

use anyhow::Result;
use async_trait::async_trait;
use imgbased::{naming::Nvr, Imgbase};

use crate::cli::LayoutOptions;

pub struct LayoutCommand {
    pub layout_options: LayoutOptions,
}

#[async_trait]
impl super::HostCommand for LayoutCommand {
    async fn execute(&self, imgbase: &Imgbase, out: &mut String) -> Result<()> {
        let layout = imgbase.layout();
        let options = &self.layout_options;

        if let (Some(nvr), Some(from)) = (&options.init_nvr, &options.from) {
            let nvr = nvr.parse::<Nvr>()?;
            let layer = layout.init_from(from, &nvr).await?;
            tracing::info!("The layout is initialized, boot into {layer} to use it");
            writeln!(out, "{layer}")?;
        } else if options.bases {
            for base in layout.bases().await? {
                writeln!(out, "{base}")?;
            }
        } else if options.layers {
            for layer in layout.layers().await? {
                writeln!(out, "{layer}")?;
            }
        } else if options.free_space {
            writeln!(out, "{}", layout.free_space().await?)?;
        } else {
            let tree = layout.tree().await?;
            let current = layout.current_layer().await.ok();
            for base in tree.bases() {
                writeln!(out, "{base}")?;
                for (i, layer) in base.layers.iter().enumerate() {
                    let branch = if i + 1 == base.layers.len() { "└" } else { "├" };
                    let running = if Some(layer) == current.as_ref() { " (running)" } else { "" };
                    writeln!(out, " {branch}╼ {layer}{running}")?;
                }
            }
        }
        Ok(())
    }
}

use std::fmt::Write as _;

use anyhow::Result;
use async_trait::async_trait;
use imgbased::{
    naming::{Layer, Nvr},
    volume::parse_size,
    Imgbase,
};

use crate::cli::BaseOptions;

pub struct BaseCommand {
    pub base_options: BaseOptions,
}

#[async_trait]
impl super::HostCommand for BaseCommand {
    async fn execute(&self, imgbase: &Imgbase, out: &mut String) -> Result<()> {
        let layout = imgbase.layout();
        let options = &self.base_options;

        if let (Some(nvr), Some(size)) = (&options.add, &options.size) {
            let nvr = nvr.parse::<Nvr>()?;
            let lv = layout.add_base(&nvr, parse_size(size)?).await?;
            tracing::info!("Added base {nvr} as {lv}");
            writeln!(out, "{nvr}")?;
        } else if options.latest {
            writeln!(out, "{}", layout.latest_base().await?)?;
        } else if let Some(nvr) = &options.remove {
            layout.remove_base(&nvr.parse()?).await?;
        } else if let Some(layer) = &options.of_layer {
            let layer = layer.parse::<Layer>()?;
            writeln!(out, "{}", layout.base_of_layer(&layer).await?)?;
        }
        Ok(())
    }
}

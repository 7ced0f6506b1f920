use std::fmt::Write as _;

use anyhow::Result;
use async_trait::async_trait;
use imgbased::{naming::Image, Imgbase};

use crate::cli::LayerOptions;

pub struct LayerCommand {
    pub layer_options: LayerOptions,
}

#[async_trait]
impl super::HostCommand for LayerCommand {
    async fn execute(&self, imgbase: &Imgbase, out: &mut String) -> Result<()> {
        let layout = imgbase.layout();
        let options = &self.layer_options;

        if let Some(target) = &options.add {
            let target = target.as_deref().map(str::parse::<Image>).transpose()?;
            let layer = layout.add_layer(target.as_ref()).await?;
            writeln!(out, "{layer}")?;
        } else if options.latest {
            writeln!(out, "{}", layout.latest_layer().await?)?;
        } else if options.current {
            writeln!(out, "{}", layout.current_layer().await?)?;
        }
        Ok(())
    }
}

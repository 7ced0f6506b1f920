use std::{fmt::Write as _, path::Path};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use imgbased::{
    volume::{parse_size, Volumes},
    Imgbase,
};

use crate::cli::VolumeOptions;

pub struct VolumeCommand {
    pub volume_options: VolumeOptions,
}

#[async_trait]
impl super::HostCommand for VolumeCommand {
    async fn execute(&self, imgbase: &Imgbase, out: &mut String) -> Result<()> {
        let volumes = Volumes::new(imgbase);
        let options = &self.volume_options;

        if let Some(create) = &options.create {
            let [path, size] = create.as_slice() else {
                bail!("--create takes a path and a size");
            };
            let size = parse_size(size).with_context(|| format!("Bad size for {path}"))?;
            let lv = volumes.create(Path::new(path), size).await?;
            writeln!(out, "{path} is now backed by {lv}")?;
        } else if let Some(path) = &options.remove {
            volumes.remove(path).await?;
        } else if let Some(path) = &options.attach {
            volumes.attach(path).await?;
        } else if let Some(path) = &options.detach {
            volumes.detach(path).await?;
        } else {
            for path in volumes.list().await? {
                writeln!(out, "{}", path.display())?;
            }
        }
        Ok(())
    }
}

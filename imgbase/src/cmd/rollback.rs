use std::fmt::Write as _;

use anyhow::Result;
use async_trait::async_trait;
use imgbased::{naming::Nvr, rollback::rollback, Imgbase};

use crate::cli::RollbackOptions;

pub struct RollbackCommand {
    pub rollback_options: RollbackOptions,
}

#[async_trait]
impl super::HostCommand for RollbackCommand {
    async fn execute(&self, imgbase: &Imgbase, out: &mut String) -> Result<()> {
        let target = self
            .rollback_options
            .to
            .as_deref()
            .map(str::parse::<Nvr>)
            .transpose()?;
        let layer = rollback(imgbase, target.as_ref()).await?;
        writeln!(out, "{layer} boots on the next reboot")?;
        Ok(())
    }
}

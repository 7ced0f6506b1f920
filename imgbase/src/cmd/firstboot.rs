use anyhow::Result;
use async_trait::async_trait;
use imgbased::{firstboot::firstboot, Imgbase};

pub struct FirstbootCommand;

#[async_trait]
impl super::HostCommand for FirstbootCommand {
    async fn execute(&self, imgbase: &Imgbase, _out: &mut String) -> Result<()> {
        if !firstboot(imgbase).await? {
            tracing::info!("This layer has booted before, nothing to do");
        }
        Ok(())
    }
}

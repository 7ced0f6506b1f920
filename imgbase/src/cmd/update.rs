use std::fmt::Write as _;

use anyhow::Result;
use async_trait::async_trait;
use imgbased::{naming::Nvr, update::Update, Imgbase};

use crate::cli::UpdateOptions;

pub struct UpdateCommand {
    pub update_options: UpdateOptions,
}

#[async_trait]
impl super::HostCommand for UpdateCommand {
    async fn execute(&self, imgbase: &Imgbase, out: &mut String) -> Result<()> {
        let fallback = self
            .update_options
            .nvr
            .as_deref()
            .map(str::parse::<Nvr>)
            .transpose()?;

        let report = Update::new(imgbase, &self.update_options.image)
            .with_fallback_nvr(fallback)
            .run()
            .await?;

        if report.dry_run {
            writeln!(out, "Would install {} as {}", report.base, report.layer)?;
            return Ok(());
        }
        writeln!(out, "Installed {} as {}", report.base, report.layer)?;
        match &report.bootid {
            Some(bootid) => writeln!(out, "Boot entry {bootid} is the default on the next boot")?,
            None => writeln!(out, "No kernel found, no boot entry was added")?,
        }
        if let Some(error) = &report.persisted_rpms_error {
            writeln!(out, "Persisted packages were not reinstalled: {error}")?;
        }
        if !report.freed.is_empty() {
            writeln!(out, "Freed {}", report.freed.join(", "))?;
        }
        if let Some(error) = &report.gc_error {
            writeln!(out, "Old bases were not freed: {error}")?;
        }
        Ok(())
    }
}

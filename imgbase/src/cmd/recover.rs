use std::fmt::Write as _;

use anyhow::{bail, Result};
use async_trait::async_trait;
use dialoguer::{console::Term, Confirm};
use imgbased::{
    recover::{find_leftovers, recover, Leftovers},
    Imgbase,
};

use crate::cli::RecoverOptions;

pub struct RecoverCommand {
    pub recover_options: RecoverOptions,
}

fn list(leftovers: &Leftovers, out: &mut String) -> Result<()> {
    for layer in &leftovers.layers {
        writeln!(out, "layer {layer}")?;
    }
    for base in &leftovers.bases {
        writeln!(out, "base {base}")?;
    }
    Ok(())
}

#[async_trait]
impl super::HostCommand for RecoverCommand {
    async fn execute(&self, imgbase: &Imgbase, out: &mut String) -> Result<()> {
        let leftovers = find_leftovers(imgbase).await?;
        if !self.recover_options.force {
            list(&leftovers, out)?;
            return Ok(());
        }
        if leftovers.is_empty() {
            tracing::info!("Nothing to recover");
            return Ok(());
        }

        if !self.recover_options.yes {
            if !Term::stderr().is_term() {
                bail!("Standard error is not a terminal. Please use '--yes' to confirm the operation in non-interactive mode.");
            }

            if !Confirm::new()
                .with_prompt(format!(
                    "{} layers and {} bases will be removed. Do you want to continue?",
                    leftovers.layers.len(),
                    leftovers.bases.len()
                ))
                .default(false)
                .interact()?
            {
                bail!("Operation canceled");
            }
        }

        let removed = recover(imgbase).await?;
        list(&removed, out)?;
        Ok(())
    }
}

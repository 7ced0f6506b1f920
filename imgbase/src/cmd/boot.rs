use std::fmt::Write as _;

use anyhow::Result;
use async_trait::async_trait;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::*;
use imgbased::{bootloader::BootEntry, Imgbase};

use crate::cli::BootOptions;

pub struct BootCommand {
    pub boot_options: BootOptions,
}

fn render_table(entries: &[BootEntry], default: Option<&BootEntry>) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Bootid", "Title", "Layer", "Kernel", "Default"]);

    for entry in entries {
        let is_default = default.is_some_and(|d| d.id == entry.id);
        table.add_row(vec![
            match &entry.bootid {
                Some(bootid) => Cell::new(bootid),
                None => Cell::new("<none>").fg(Color::DarkGrey),
            },
            Cell::new(&entry.title),
            match &entry.layer {
                Some(layer) => Cell::new(layer),
                None => Cell::new("<unknown>").fg(Color::Yellow),
            },
            Cell::new(&entry.kernel),
            if is_default {
                Cell::new("True").fg(Color::Green)
            } else {
                Cell::new("False")
            },
        ]);
    }
    table.to_string()
}

#[async_trait]
impl super::HostCommand for BootCommand {
    async fn execute(&self, imgbase: &Imgbase, out: &mut String) -> Result<()> {
        let bootloader = imgbase.bootloader();
        let options = &self.boot_options;

        if options.get_default {
            match bootloader.get_default().await? {
                Some(entry) if options.json => {
                    writeln!(out, "{}", serde_json::to_string_pretty(&entry)?)?
                }
                Some(entry) => writeln!(
                    out,
                    "{}",
                    entry.layer.as_deref().unwrap_or(entry.title.as_str())
                )?,
                None => tracing::warn!("There is no default boot entry"),
            }
        } else if let Some(spec) = &options.set_default {
            let layer = super::resolve_layer(imgbase, spec).await?;
            bootloader.set_default(&layer).await?;
            writeln!(out, "{layer} boots on the next reboot")?;
        } else if options.remove_other_boot_entries {
            let known = imgbase.layout().layers().await?;
            for entry in bootloader.remove_other_entries(&known).await? {
                writeln!(out, "Removed {:?}", entry.title)?;
            }
        } else {
            let entries = bootloader.entries().await?;
            if options.json {
                writeln!(out, "{}", serde_json::to_string_pretty(&entries)?)?;
            } else {
                let default = bootloader.get_default().await?;
                writeln!(out, "{}", render_table(&entries, default.as_ref()))?;
            }
        }
        Ok(())
    }
}

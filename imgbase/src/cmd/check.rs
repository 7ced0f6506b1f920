use std::fmt::Write as _;

use anyhow::{bail, Result};
use async_trait::async_trait;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::*;
use imgbased::{
    check::{run_checks, CheckResult},
    Imgbase,
};

use crate::cli::CheckOptions;

pub struct CheckCommand {
    pub check_options: CheckOptions,
}

pub fn render_table(results: &[CheckResult]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Check", "Status", "Detail"]);

    for result in results {
        table.add_row(vec![
            Cell::new(result.name),
            if result.passed {
                Cell::new("OK").fg(Color::Green)
            } else {
                Cell::new("FAILED").fg(Color::Red)
            },
            Cell::new(&result.detail),
        ]);
    }
    table.to_string()
}

#[async_trait]
impl super::HostCommand for CheckCommand {
    async fn execute(&self, imgbase: &Imgbase, out: &mut String) -> Result<()> {
        let results = run_checks(imgbase).await;
        if self.check_options.json {
            writeln!(out, "{}", serde_json::to_string_pretty(&results)?)?;
        } else {
            writeln!(out, "{}", render_table(&results))?;
        }

        let failed = results.iter().filter(|r| !r.passed).count();
        if failed > 0 {
            bail!("{failed} of {} checks failed", results.len());
        }
        Ok(())
    }
}

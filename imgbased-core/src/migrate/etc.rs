use std::path::Path;

use anyhow::Result;

use crate::{
    fs::{copy_file, read_optional, sync::rsync, write_file},
    lvm::LogicalVolume,
    runner::Runner,
};

/// Files carried over when the product of the two layers differs.
pub const MINIMAL_ETC: &[&str] = &["fstab", "passwd", "shadow", "group"];

/// Release files of the new image win over the previous layer.
const RELEASE_EXCLUDE: &str = "etc/*-release*";

pub const GRUB_DEFAULTS: &str = "etc/default/grub";
const GRUB_CMDLINE_KEY: &str = "GRUB_CMDLINE_LINUX";

/// Carry `/etc` of `prev_root` over into `new_root`.
pub async fn migrate_etc(
    runner: &Runner,
    prev_root: &Path,
    new_root: &Path,
    same_product: bool,
) -> Result<()> {
    if same_product {
        tracing::info!("Synchronizing /etc from the previous layer");
        return rsync(runner, prev_root.join("etc"), new_root, &[RELEASE_EXCLUDE]).await;
    }

    tracing::info!("Products differ, carrying over only {}", MINIMAL_ETC.join(", "));
    for name in MINIMAL_ETC {
        let src = prev_root.join("etc").join(name);
        if !src.exists() {
            tracing::info!("No {src:?} on the previous layer, skipping it");
            continue;
        }
        copy_file(runner, &src, new_root.join("etc").join(name)).await?;
    }
    Ok(())
}

/// Point the entry for `/` at `device`, keeping the rest of every line as is.
pub fn rewrite_fstab(content: &str, device: &str) -> String {
    content
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let mut fields = trimmed.split_whitespace();
            let is_root = !trimmed.starts_with('#') && fields.nth(1) == Some("/");
            if !is_root {
                return format!("{line}\n");
            }
            let rest = trimmed
                .find(char::is_whitespace)
                .map(|pos| &trimmed[pos..])
                .unwrap_or_default();
            format!("{device}{rest}\n")
        })
        .collect()
}

pub async fn update_fstab(runner: &Runner, new_root: &Path, lv: &LogicalVolume) -> Result<()> {
    let path = new_root.join("etc/fstab");
    let Some(content) = read_optional(&path).await? else {
        tracing::info!("No fstab on the new layer, nothing to rewrite");
        return Ok(());
    };
    let device = lv.path();
    write_file(runner, &path, rewrite_fstab(&content, &device.to_string_lossy())).await
}

/// Value of `GRUB_CMDLINE_LINUX` without its quotes.
pub fn grub_cmdline(defaults: &str) -> Option<String> {
    defaults.lines().find_map(|line| {
        let value = line
            .trim()
            .strip_prefix(GRUB_CMDLINE_KEY)?
            .strip_prefix('=')?;
        Some(value.trim().trim_matches('"').trim_matches('\'').to_owned())
    })
}

/// Replace or append `GRUB_CMDLINE_LINUX`.
pub fn set_grub_cmdline(defaults: &str, cmdline: &str) -> String {
    let assignment = format!("{GRUB_CMDLINE_KEY}=\"{cmdline}\"");
    let mut replaced = false;
    let mut out = defaults
        .lines()
        .map(|line| {
            if line.trim().starts_with(&format!("{GRUB_CMDLINE_KEY}=")) {
                replaced = true;
                format!("{assignment}\n")
            } else {
                format!("{line}\n")
            }
        })
        .collect::<String>();
    if !replaced {
        out.push_str(&assignment);
        out.push('\n');
    }
    out
}

/// Every spelling of `from` found on kernel command lines, replaced by the same spelling of `to`.
pub fn replace_lv_references(text: &str, from: &LogicalVolume, to: &LogicalVolume) -> String {
    let mapper = |lv: &LogicalVolume| {
        format!("{}-{}", lv.vg.replace('-', "--"), lv.name.replace('-', "--"))
    };
    text.replace(&mapper(from), &mapper(to))
        .replace(&from.lvm_name(), &to.lvm_name())
}

/// Take `GRUB_CMDLINE_LINUX` from the previous layer into the new one, with references to the
/// previous root volume moved to the new one. Returns the resulting value.
pub async fn update_grub_defaults(
    runner: &Runner,
    prev_root: &Path,
    new_root: &Path,
    prev_lv: &LogicalVolume,
    new_lv: &LogicalVolume,
) -> Result<Option<String>> {
    let Some(prev_cmdline) = read_optional(prev_root.join(GRUB_DEFAULTS))
        .await?
        .as_deref()
        .and_then(grub_cmdline)
    else {
        tracing::info!("No {GRUB_CMDLINE_KEY} on the previous layer");
        return Ok(None);
    };

    let cmdline = replace_lv_references(&prev_cmdline, prev_lv, new_lv);
    let path = new_root.join(GRUB_DEFAULTS);
    let current = read_optional(&path).await?.unwrap_or_default();
    write_file(runner, &path, set_grub_cmdline(&current, &cmdline)).await?;
    Ok(Some(cmdline))
}

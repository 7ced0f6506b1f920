//! Boot entries of layers.
//!
//! Every entry created here carries `img.bootid=<token>` on its kernel command line. The token is
//! the handle used to find the entry again when setting the default or removing it.

pub mod bls;
pub mod grubby;
pub mod syslinux;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::Serialize;
use strum::{Display, EnumString};

use crate::{
    config::Config,
    error::Error,
    naming::Layer,
    runner::Runner,
};

pub use bls::BlsDirectory;
pub use grubby::Grubby;
pub use syslinux::SyslinuxConfig;

pub const BOOTID_ARG: &str = "img.bootid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BootloaderKind {
    Grubby,
    Syslinux,
    Bls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootEntry {
    /// Handle of the entry inside its bootloader: grubby index, syslinux label or BLS file stem.
    pub id: String,
    pub bootid: Option<String>,
    pub title: String,
    /// Kernel path relative to `/boot`, with a leading slash.
    pub kernel: String,
    pub initrd: Option<String>,
    pub cmdline: String,
    /// Name of the layer this entry boots.
    pub layer: Option<String>,
}

impl BootEntry {
    /// Fill `bootid` and `layer` from the kernel path and command line.
    fn derive_references(mut self) -> Self {
        self.bootid = bootid_of(&self.cmdline);
        self.layer = layer_reference(&self.kernel, &self.cmdline);
        self
    }
}

pub fn bootid_of(cmdline: &str) -> Option<String> {
    cmdline
        .split_whitespace()
        .find_map(|arg| arg.strip_prefix(BOOTID_ARG)?.strip_prefix('='))
        .map(ToOwned::to_owned)
}

/// The layer an entry boots: the directory of `/<layer>/vmlinuz-*`, else the LV in `root=`.
pub fn layer_reference(kernel: &str, cmdline: &str) -> Option<String> {
    let from_kernel = kernel
        .trim_start_matches("/boot")
        .trim_start_matches('/')
        .split_once('/')
        .map(|(dir, _)| dir)
        .filter(|dir| dir.parse::<Layer>().is_ok());
    if let Some(layer) = from_kernel {
        return Some(layer.to_owned());
    }

    cmdline
        .split_whitespace()
        .find_map(|arg| arg.strip_prefix("root="))
        .and_then(|root| root.rsplit('/').next())
        .filter(|name| name.parse::<Layer>().is_ok())
        .map(ToOwned::to_owned)
}

/// `5.14.0-1.el9` out of `.../vmlinuz-5.14.0-1.el9`.
pub fn kernel_version(vmlinuz: &str) -> Option<String> {
    Path::new(vmlinuz)
        .file_name()?
        .to_str()?
        .strip_prefix("vmlinuz-")
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

/// A fresh 8 character token not used by any of `entries`.
pub fn new_bootid(entries: &[BootEntry]) -> String {
    loop {
        let token = hex::encode(rand::random::<[u8; 4]>());
        if !entries
            .iter()
            .any(|e| e.bootid.as_deref() == Some(token.as_str()))
        {
            return token;
        }
        tracing::debug!("Bootid {token} already in use, drawing another");
    }
}

pub enum Bootloader {
    Grubby(Grubby),
    Syslinux(SyslinuxConfig),
    Bls(BlsDirectory),
}

impl Bootloader {
    pub fn from_config(runner: &Runner, config: &Config, boot_dir: impl Into<PathBuf>) -> Self {
        let boot_dir = boot_dir.into();
        match config.bootloader_kind() {
            BootloaderKind::Grubby => {
                Bootloader::Grubby(Grubby::new(runner, boot_dir, config.bootloader_config()))
            }
            BootloaderKind::Syslinux => {
                Bootloader::Syslinux(SyslinuxConfig::new(runner, config.bootloader_config()))
            }
            BootloaderKind::Bls => {
                Bootloader::Bls(BlsDirectory::new(runner, config.bootloader_entries()))
            }
        }
    }

    pub fn kind(&self) -> BootloaderKind {
        match self {
            Bootloader::Grubby(_) => BootloaderKind::Grubby,
            Bootloader::Syslinux(_) => BootloaderKind::Syslinux,
            Bootloader::Bls(_) => BootloaderKind::Bls,
        }
    }

    pub async fn entries(&self) -> Result<Vec<BootEntry>> {
        match self {
            Bootloader::Grubby(b) => b.entries().await,
            Bootloader::Syslinux(b) => b.entries().await,
            Bootloader::Bls(b) => b.entries().await,
        }
        .context("Failed to list boot entries")
    }

    /// Add an entry booting `layer` and return its bootid.
    ///
    /// `kernel` and `initrd` are relative to `/boot`.
    pub async fn add(
        &self,
        layer: &Layer,
        title: &str,
        kernel: &str,
        initrd: Option<&str>,
        cmdline: &str,
    ) -> Result<String> {
        let existing = self.entries().await?;
        let bootid = new_bootid(&existing);

        let stamp = format!("{BOOTID_ARG}={bootid}");
        let cmdline = cmdline
            .split_whitespace()
            .filter(|arg| bootid_of(arg).is_none())
            .chain([stamp.as_str()])
            .collect::<Vec<_>>()
            .join(" ");
        let title = match kernel_version(kernel) {
            Some(version) => format!("{title} ({version})"),
            None => title.to_owned(),
        };
        let with_slash = |p: &str| format!("/{}", p.trim_start_matches('/'));

        let entry = BootEntry {
            id: bootid.clone(),
            bootid: Some(bootid.clone()),
            title,
            kernel: with_slash(kernel),
            initrd: initrd.map(with_slash),
            cmdline,
            layer: Some(layer.to_string()),
        };

        tracing::info!("Adding boot entry {:?} for {layer}", entry.title);
        match self {
            Bootloader::Grubby(b) => b.add_entry(&entry).await,
            Bootloader::Syslinux(b) => b.add_entry(&entry).await,
            Bootloader::Bls(b) => b.add_entry(&entry).await,
        }
        .with_context(|| format!("Failed to add boot entry for {layer}"))?;

        Ok(bootid)
    }

    async fn remove_entry(&self, entry: &BootEntry) -> Result<()> {
        tracing::info!("Removing boot entry {:?}", entry.title);
        match self {
            Bootloader::Grubby(b) => b.remove_entry(entry).await,
            Bootloader::Syslinux(b) => b.remove_entry(entry).await,
            Bootloader::Bls(b) => b.remove_entry(entry).await,
        }
        .with_context(|| format!("Failed to remove boot entry {:?}", entry.title))
    }

    /// Remove the entry carrying `bootid`. Absent entries are not an error.
    pub async fn remove(&self, bootid: &str) -> Result<()> {
        let entries = self.entries().await?;
        match entries
            .iter()
            .find(|e| e.bootid.as_deref() == Some(bootid))
        {
            Some(entry) => self.remove_entry(entry).await,
            None => {
                tracing::debug!("No boot entry with bootid {bootid}, nothing to remove");
                Ok(())
            }
        }
    }

    pub async fn entry_of(&self, layer: &Layer) -> Result<Option<BootEntry>> {
        let layer = layer.to_string();
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.bootid.is_some() && e.layer.as_deref() == Some(layer.as_str()))
            .last())
    }

    pub async fn set_default(&self, layer: &Layer) -> Result<()> {
        let entry = self
            .entry_of(layer)
            .await?
            .ok_or_else(|| Error::BootEntryMissing(layer.to_string()))?;

        self.set_default_entry(&entry)
            .await
            .with_context(|| format!("Failed to make {layer} the default boot entry"))
    }

    /// Make `previous`, as returned by [`Bootloader::get_default`] earlier, the default again.
    /// Stamped entries are looked up by their bootid, the handle of others may not have moved.
    pub async fn restore_default(&self, previous: &BootEntry) -> Result<()> {
        let entry = match &previous.bootid {
            Some(bootid) => self
                .entries()
                .await?
                .into_iter()
                .find(|e| e.bootid.as_deref() == Some(bootid.as_str()))
                .ok_or_else(|| Error::BootEntryMissing(bootid.clone()))?,
            None => previous.clone(),
        };
        self.set_default_entry(&entry)
            .await
            .with_context(|| format!("Failed to restore the default boot entry {:?}", entry.title))
    }

    async fn set_default_entry(&self, entry: &BootEntry) -> Result<()> {
        tracing::info!("Setting default boot entry to {:?}", entry.title);
        match self {
            Bootloader::Grubby(b) => b.set_default_entry(entry).await,
            Bootloader::Syslinux(b) => b.set_default_entry(entry).await,
            Bootloader::Bls(b) => b.set_default_entry(entry).await,
        }
    }

    pub async fn get_default(&self) -> Result<Option<BootEntry>> {
        let default_id = match self {
            Bootloader::Grubby(b) => b.default_id().await,
            Bootloader::Syslinux(b) => b.default_id().await,
            Bootloader::Bls(b) => b.default_id().await,
        }
        .context("Failed to read the default boot entry")?;

        let Some(default_id) = default_id else {
            return Ok(None);
        };
        Ok(self
            .entries()
            .await?
            .into_iter()
            .find(|e| e.id == default_id))
    }

    /// Remove `entries`, highest handle first so grubby indexes of the remaining ones stay
    /// valid.
    async fn remove_all(&self, mut entries: Vec<BootEntry>) -> Result<Vec<BootEntry>> {
        entries.sort_by_key(|e| std::cmp::Reverse(e.id.parse::<usize>().ok()));
        for entry in &entries {
            self.remove_entry(entry).await?;
        }
        Ok(entries)
    }

    pub async fn remove_entries_of(&self, layer: &Layer) -> Result<()> {
        let layer = layer.to_string();
        let entries = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.layer.as_deref() == Some(layer.as_str()))
            .collect();
        self.remove_all(entries).await?;
        Ok(())
    }

    /// Remove every entry which does not carry a bootid of one of `known` layers. Returns the
    /// removed entries.
    pub async fn remove_other_entries(&self, known: &[Layer]) -> Result<Vec<BootEntry>> {
        let known = known.iter().map(ToString::to_string).collect::<Vec<_>>();
        let others = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.bootid.is_none() || !e.layer.as_ref().is_some_and(|l| known.contains(l)))
            .collect();
        self.remove_all(others).await
    }
}

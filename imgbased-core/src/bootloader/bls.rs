use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use super::{kernel_version, BootEntry};
use crate::{
    fs::{read_optional, remove_path, write_file},
    runner::{safe_write::SafeWrite, Runner},
};

/// A Boot Loader Specification entry directory, one `<id>.conf` per entry. The default lives in
/// `loader.conf` next to the directory as `default <id>.conf`.
pub struct BlsDirectory {
    runner: Runner,
    entries_dir: PathBuf,
}

impl BlsDirectory {
    pub fn new(runner: &Runner, entries_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner: runner.clone(),
            entries_dir: entries_dir.into(),
        }
    }

    fn loader_conf(&self) -> PathBuf {
        self.entries_dir
            .parent()
            .unwrap_or(Path::new("/"))
            .join("loader.conf")
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.entries_dir.join(format!("{id}.conf"))
    }

    pub async fn entries(&self) -> Result<Vec<BootEntry>> {
        if !self.entries_dir.is_dir() {
            return Ok(vec![]);
        }

        let mut paths = vec![];
        let mut dir = tokio::fs::read_dir(&self.entries_dir)
            .await
            .with_context(|| format!("Failed to list {:?}", self.entries_dir))?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "conf") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut entries = vec![];
        for path in paths {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {path:?}"))?;
            if let Some(entry) = parse_entry(id, &content) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn add_entry(&self, entry: &BootEntry) -> Result<()> {
        let id = entry.bootid.as_deref().unwrap_or(entry.id.as_str());
        let mut content = format!("title {}\n", entry.title);
        if let Some(version) = kernel_version(&entry.kernel) {
            content.push_str(&format!("version {version}\n"));
        }
        content.push_str(&format!("linux {}\n", entry.kernel));
        if let Some(initrd) = &entry.initrd {
            content.push_str(&format!("initrd {initrd}\n"));
        }
        content.push_str(&format!("options {}\n", entry.cmdline));

        write_file(&self.runner, self.entry_path(id), content).await
    }

    pub async fn remove_entry(&self, entry: &BootEntry) -> Result<()> {
        remove_path(&self.runner, self.entry_path(&entry.id)).await
    }

    pub async fn set_default_entry(&self, entry: &BootEntry) -> Result<()> {
        let path = self.loader_conf();
        let current = read_optional(&path).await?.unwrap_or_default();
        let mut content = current
            .lines()
            .filter(|line| line.split_whitespace().next() != Some("default"))
            .map(|line| format!("{line}\n"))
            .collect::<String>();
        content.push_str(&format!("default {}.conf\n", entry.id));

        SafeWrite::guarded(&path, write_file(&self.runner, &path, content)).await
    }

    pub async fn default_id(&self) -> Result<Option<String>> {
        let content = read_optional(self.loader_conf()).await?.unwrap_or_default();
        Ok(content.lines().find_map(|line| {
            let mut words = line.split_whitespace();
            (words.next() == Some("default"))
                .then(|| words.next())
                .flatten()
                .map(|value| value.trim_end_matches(".conf").to_owned())
        }))
    }
}

fn parse_entry(id: &str, content: &str) -> Option<BootEntry> {
    let mut entry = BootEntry {
        id: id.to_owned(),
        bootid: None,
        title: String::new(),
        kernel: String::new(),
        initrd: None,
        cmdline: String::new(),
        layer: None,
    };
    for line in content.lines() {
        let Some((key, value)) = line.trim().split_once(char::is_whitespace) else {
            continue;
        };
        let value = value.trim().to_owned();
        match key {
            "title" => entry.title = value,
            "linux" => entry.kernel = value,
            "initrd" => entry.initrd = Some(value),
            "options" => entry.cmdline = value,
            _ => {}
        }
    }
    (!entry.kernel.is_empty()).then(|| entry.derive_references())
}

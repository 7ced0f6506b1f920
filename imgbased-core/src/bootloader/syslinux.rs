use std::path::PathBuf;

use anyhow::Result;

use super::BootEntry;
use crate::{
    fs::{read_optional, write_file},
    runner::{safe_write::SafeWrite, Runner},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Stanza {
    label: String,
    title: String,
    kernel: String,
    initrd: Option<String>,
    append: String,
}

/// Parsed syslinux/extlinux configuration. Lines before the first `LABEL`, other than `DEFAULT`,
/// are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Document {
    default: Option<String>,
    globals: Vec<String>,
    stanzas: Vec<Stanza>,
}

impl Document {
    fn parse(content: &str) -> Self {
        let mut doc = Document::default();
        for line in content.lines() {
            let trimmed = line.trim();
            let (keyword, rest) = trimmed
                .split_once(char::is_whitespace)
                .map(|(k, r)| (k, r.trim()))
                .unwrap_or((trimmed, ""));
            let keyword = keyword.to_ascii_uppercase();

            if keyword == "LABEL" {
                doc.stanzas.push(Stanza {
                    label: rest.to_owned(),
                    ..Default::default()
                });
                continue;
            }

            match doc.stanzas.last_mut() {
                None if keyword == "DEFAULT" => doc.default = Some(rest.to_owned()),
                None => {
                    if !trimmed.is_empty() {
                        doc.globals.push(line.to_owned());
                    }
                }
                Some(stanza) => match keyword.as_str() {
                    "MENU" => {
                        if let Some(title) = rest.strip_prefix("LABEL").or(rest.strip_prefix("label"))
                        {
                            stanza.title = title.trim().to_owned();
                        }
                    }
                    "KERNEL" | "LINUX" => stanza.kernel = rest.to_owned(),
                    "INITRD" => stanza.initrd = Some(rest.to_owned()),
                    "APPEND" => stanza.append = rest.to_owned(),
                    _ => {}
                },
            }
        }
        doc
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(default) = &self.default {
            out.push_str(&format!("DEFAULT {default}\n"));
        }
        for line in &self.globals {
            out.push_str(line);
            out.push('\n');
        }
        for stanza in &self.stanzas {
            out.push_str(&format!("\nLABEL {}\n", stanza.label));
            out.push_str(&format!("  MENU LABEL {}\n", stanza.title));
            out.push_str(&format!("  KERNEL {}\n", stanza.kernel));
            if let Some(initrd) = &stanza.initrd {
                out.push_str(&format!("  INITRD {initrd}\n"));
            }
            out.push_str(&format!("  APPEND {}\n", stanza.append));
        }
        out
    }

    fn entries(&self) -> Vec<BootEntry> {
        self.stanzas
            .iter()
            .filter(|s| !s.kernel.is_empty())
            .map(|s| {
                BootEntry {
                    id: s.label.clone(),
                    bootid: None,
                    title: s.title.clone(),
                    kernel: s.kernel.clone(),
                    initrd: s.initrd.clone(),
                    cmdline: s.append.clone(),
                    layer: None,
                }
                .derive_references()
            })
            .collect()
    }
}

/// A syslinux configuration file rendered in-process.
pub struct SyslinuxConfig {
    runner: Runner,
    path: PathBuf,
}

impl SyslinuxConfig {
    pub fn new(runner: &Runner, path: impl Into<PathBuf>) -> Self {
        Self {
            runner: runner.clone(),
            path: path.into(),
        }
    }

    async fn load(&self) -> Result<Document> {
        Ok(read_optional(&self.path)
            .await?
            .map(|content| Document::parse(&content))
            .unwrap_or_default())
    }

    async fn update(&self, f: impl FnOnce(&mut Document)) -> Result<()> {
        let mut doc = self.load().await?;
        f(&mut doc);
        let content = doc.render();
        SafeWrite::guarded(&self.path, write_file(&self.runner, &self.path, content)).await
    }

    pub async fn entries(&self) -> Result<Vec<BootEntry>> {
        Ok(self.load().await?.entries())
    }

    pub async fn add_entry(&self, entry: &BootEntry) -> Result<()> {
        let stanza = Stanza {
            label: entry.bootid.clone().unwrap_or_else(|| entry.id.clone()),
            title: entry.title.clone(),
            kernel: entry.kernel.clone(),
            initrd: entry.initrd.clone(),
            append: entry.cmdline.clone(),
        };
        self.update(|doc| doc.stanzas.push(stanza)).await
    }

    pub async fn remove_entry(&self, entry: &BootEntry) -> Result<()> {
        self.update(|doc| {
            doc.stanzas.retain(|s| s.label != entry.id);
            if doc.default.as_deref() == Some(entry.id.as_str()) {
                doc.default = None;
            }
        })
        .await
    }

    pub async fn set_default_entry(&self, entry: &BootEntry) -> Result<()> {
        self.update(|doc| doc.default = Some(entry.id.clone())).await
    }

    pub async fn default_id(&self) -> Result<Option<String>> {
        Ok(self.load().await?.default)
    }
}

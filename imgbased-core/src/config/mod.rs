pub mod source;

use std::{fmt::Display, path::PathBuf};

use anyhow::{Context as _, Result};
use indexmap::IndexMap;
use ini::Ini;

use crate::{bootloader::BootloaderKind, fs::mkfs::FsKind};

pub use source::{ConfigSource, FileSystemConfigSource, InMemoryConfigSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Bool,
    Int,
    Str,
}

/// One known `section.key` and its typed default.
#[derive(Debug)]
pub struct Field {
    pub section: &'static str,
    pub key: &'static str,
    pub kind: Kind,
    pub default: &'static str,
}

macro_rules! field {
    ($section:literal . $key:literal : $kind:ident = $default:literal) => {
        Field {
            section: $section,
            key: $key,
            kind: Kind::$kind,
            default: $default,
        }
    };
}

pub const SCHEMA: &[Field] = &[
    field!("update"."images_to_keep": Int = "2"),
    field!("update"."reconcile_ids": Bool = "no"),
    field!("update"."regenerate_initramfs": Bool = "no"),
    field!("update"."reinstall_persisted_rpms": Bool = "yes"),
    field!("bootloader"."kind": Str = "grubby"),
    field!("bootloader"."config": Str = "/boot/grub2/grub.cfg"),
    field!("bootloader"."entries": Str = "/boot/loader/entries"),
    field!("volume"."automount": Bool = "no"),
    field!("volume"."filesystem": Str = "ext4"),
    field!("check"."pool_usage_threshold": Int = "80"),
    field!("check"."min_metadata_size_mb": Int = "1024"),
    field!("hooks"."dir": Str = "/usr/lib/imgbased/hooks.d"),
    field!("firstboot"."replay_post": Str = ""),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    /// Booleans first, then all-digit integers, anything else stays a string.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "yes" | "true" | "on" => return Value::Bool(true),
            "no" | "false" | "off" => return Value::Bool(false),
            _ => {}
        }
        if !raw.is_empty() && raw.bytes().all(|c| c.is_ascii_digit()) {
            if let Ok(i) = raw.parse() {
                return Value::Int(i);
            }
        }
        Value::Str(raw.to_owned())
    }

    fn typed(raw: &str, kind: Kind) -> Option<Self> {
        match (kind, Self::parse(raw)) {
            (Kind::Bool, v @ Value::Bool(_)) | (Kind::Int, v @ Value::Int(_)) => Some(v),
            (Kind::Str, _) => Some(Value::Str(raw.trim().to_owned())),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(true) => write!(f, "yes"),
            Value::Bool(false) => write!(f, "no"),
            Value::Int(i) => i.fmt(f),
            Value::Str(s) => s.fmt(f),
        }
    }
}

/// Effective configuration: schema defaults overlaid by every loaded file in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    values: IndexMap<(&'static str, &'static str), Value>,
}

impl Default for Config {
    fn default() -> Self {
        let values = SCHEMA
            .iter()
            .filter_map(|field| {
                Value::typed(field.default, field.kind).map(|v| ((field.section, field.key), v))
            })
            .collect();
        Self { values }
    }
}

impl Config {
    /// Merge `(origin, content)` pairs in order, later ones win.
    pub fn from_layers<I, S>(layers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, String)>,
        S: Display,
    {
        let mut config = Config::default();
        for (origin, content) in layers {
            config
                .merge_str(&content, &origin.to_string())
                .with_context(|| format!("Failed to parse config {origin}"))?;
        }
        Ok(config)
    }

    fn merge_str(&mut self, content: &str, origin: &str) -> Result<()> {
        let ini = Ini::load_from_str(content)?;
        for (section, properties) in ini.iter() {
            let section = section.unwrap_or("<general>");
            for (key, raw) in properties.iter() {
                let Some(field) = SCHEMA
                    .iter()
                    .find(|f| f.section == section && f.key == key)
                else {
                    tracing::warn!("Ignoring unknown config key {section}.{key} in {origin}");
                    continue;
                };
                match Value::typed(raw, field.kind) {
                    Some(value) => {
                        tracing::debug!("{section}.{key} = {value} from {origin}");
                        self.values.insert((field.section, field.key), value);
                    }
                    None => tracing::warn!(
                        "Ignoring {section}.{key} = {raw:?} in {origin}, expected {:?}",
                        field.kind
                    ),
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|((s, k), _)| *s == section && *k == key)
            .map(|(_, v)| v)
    }

    /// All effective values in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (String, &Value)> {
        self.values
            .iter()
            .map(|((section, key), value)| (format!("{section}.{key}"), value))
    }

    fn bool(&self, section: &str, key: &str) -> bool {
        matches!(self.get(section, key), Some(Value::Bool(true)))
    }

    fn int(&self, section: &str, key: &str) -> i64 {
        match self.get(section, key) {
            Some(Value::Int(i)) => *i,
            _ => 0,
        }
    }

    fn str(&self, section: &str, key: &str) -> &str {
        match self.get(section, key) {
            Some(Value::Str(s)) => s,
            _ => "",
        }
    }

    pub fn images_to_keep(&self) -> usize {
        self.int("update", "images_to_keep").max(1) as usize
    }

    pub fn reconcile_ids(&self) -> bool {
        self.bool("update", "reconcile_ids")
    }

    pub fn regenerate_initramfs(&self) -> bool {
        self.bool("update", "regenerate_initramfs")
    }

    pub fn reinstall_persisted_rpms(&self) -> bool {
        self.bool("update", "reinstall_persisted_rpms")
    }

    pub fn bootloader_kind(&self) -> BootloaderKind {
        let kind = self.str("bootloader", "kind");
        kind.parse().unwrap_or_else(|_| {
            tracing::warn!("Unknown bootloader kind {kind:?}, using grubby");
            BootloaderKind::Grubby
        })
    }

    pub fn bootloader_config(&self) -> PathBuf {
        PathBuf::from(self.str("bootloader", "config"))
    }

    pub fn bootloader_entries(&self) -> PathBuf {
        PathBuf::from(self.str("bootloader", "entries"))
    }

    pub fn volume_automount(&self) -> bool {
        self.bool("volume", "automount")
    }

    pub fn volume_filesystem(&self) -> FsKind {
        let kind = self.str("volume", "filesystem");
        kind.parse().unwrap_or_else(|_| {
            tracing::warn!("Unsupported volume filesystem {kind:?}, using ext4");
            FsKind::Ext4
        })
    }

    pub fn pool_usage_threshold(&self) -> f64 {
        self.int("check", "pool_usage_threshold") as f64
    }

    pub fn min_metadata_size_bytes(&self) -> u64 {
        self.int("check", "min_metadata_size_mb").max(0) as u64 * 1024 * 1024
    }

    pub fn hooks_dir(&self) -> PathBuf {
        PathBuf::from(self.str("hooks", "dir"))
    }

    pub fn replay_post(&self) -> Vec<String> {
        self.str("firstboot", "replay_post")
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(ToOwned::to_owned)
            .collect()
    }
}

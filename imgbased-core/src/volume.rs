//! Thin volumes bound to host paths such as `/var/log`, surviving layer switches.
//!
//! The volume of `/var/log-archive` is named `var-log--archive`: the leading slash is dropped,
//! dashes are doubled and slashes become single dashes.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context as _, Result};

use crate::{
    error::Error,
    fs::{mount::Mounted, remove_path, sync::rsync, write_file},
    hooks::Event,
    imgbase::Imgbase,
    lvm::{LogicalVolume, TAG_VOLUME},
};

/// Volume name of `path`. Fails for paths which cannot be named unambiguously.
pub fn encode(path: &Path) -> Result<String> {
    let components = normalized(path)?;
    if components.is_empty() {
        bail!(Error::InvalidName(path.display().to_string()));
    }
    if components
        .iter()
        .any(|c| c.starts_with('-') || c.ends_with('-'))
    {
        bail!(Error::InvalidName(format!(
            "{} (components may not start or end with '-')",
            path.display()
        )));
    }
    Ok(components
        .iter()
        .map(|c| c.replace('-', "--"))
        .collect::<Vec<_>>()
        .join("-"))
}

pub fn decode(name: &str) -> PathBuf {
    let mut path = String::from("/");
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                path.push('-');
            }
            '-' => path.push('/'),
            c => path.push(c),
        }
    }
    PathBuf::from(path)
}

fn normalized(path: &Path) -> Result<Vec<String>> {
    if !path.is_absolute() {
        bail!(Error::InvalidName(format!("{} is not absolute", path.display())));
    }
    path.components()
        .filter_map(|c| match c {
            Component::Normal(c) => Some(Ok(c.to_string_lossy().into_owned())),
            Component::RootDir | Component::CurDir => None,
            _ => Some(Err(Error::InvalidName(path.display().to_string()).into())),
        })
        .collect()
}

/// The systemd unit name of the mount point `path`, as `systemd-escape --path` builds it.
pub fn unit_name(path: &Path, suffix: &str) -> String {
    let joined = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(c) => Some(c.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        return format!("-.{suffix}");
    }

    let mut escaped = String::new();
    for (i, b) in joined.bytes().enumerate() {
        match b {
            b'/' => escaped.push('-'),
            b'.' if i > 0 => escaped.push('.'),
            b if b.is_ascii_alphanumeric() || b == b':' || b == b'_' => escaped.push(b as char),
            b => escaped.push_str(&format!("\\x{b:02x}")),
        }
    }
    format!("{escaped}.{suffix}")
}

pub fn mount_unit(lv: &LogicalVolume, path: &Path) -> String {
    format!(
        "[Mount]\n\
         What={}\n\
         Where={}\n\
         Options=discard\n\
         SloppyOptions=yes\n\
         \n\
         [Install]\n\
         WantedBy=local-fs.target\n",
        lv.path().display(),
        path.display()
    )
}

pub fn automount_unit(path: &Path) -> String {
    format!(
        "[Automount]\n\
         Where={}\n\
         \n\
         [Install]\n\
         WantedBy=local-fs.target\n",
        path.display()
    )
}

/// Bytes out of `4096`, `512M` or `10G`. Suffixes are binary.
pub fn parse_size(size: &str) -> Result<u64> {
    let size = size.trim();
    let (digits, shift) = match size.char_indices().last() {
        Some((i, 'K' | 'k')) => (&size[..i], 10),
        Some((i, 'M' | 'm')) => (&size[..i], 20),
        Some((i, 'G' | 'g')) => (&size[..i], 30),
        Some((i, 'T' | 't')) => (&size[..i], 40),
        _ => (size, 0),
    };
    let value = digits
        .parse::<u64>()
        .with_context(|| format!("Invalid size {size:?}"))?;
    value
        .checked_mul(1 << shift)
        .with_context(|| format!("Size {size:?} is too large"))
}

pub struct Volumes<'a> {
    imgbase: &'a Imgbase,
}

impl<'a> Volumes<'a> {
    pub fn new(imgbase: &'a Imgbase) -> Self {
        Self { imgbase }
    }

    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut paths = self
            .imgbase
            .lvm()
            .list_lvs(Some(TAG_VOLUME))
            .await?
            .into_iter()
            .map(|lv| decode(&lv.name))
            .collect::<Vec<_>>();
        paths.sort();
        Ok(paths)
    }

    pub async fn is_volume(&self, path: &Path) -> Result<bool> {
        let name = encode(path)?;
        Ok(self
            .imgbase
            .lvm()
            .list_lvs(Some(TAG_VOLUME))
            .await?
            .iter()
            .any(|lv| lv.name == name))
    }

    async fn lv_of(&self, path: &Path) -> Result<LogicalVolume> {
        if !self.is_volume(path).await? {
            bail!(Error::NotAVolume(path.to_path_buf()));
        }
        self.imgbase.layout().lv_of(&encode(path)?).await
    }

    fn units(&self, path: &Path) -> Vec<String> {
        let mut units = vec![unit_name(path, "mount")];
        if self.imgbase.config().volume_automount() {
            units.push(unit_name(path, "automount"));
        }
        units
    }

    /// The unit started for `path`: the automount unit if configured, the mount unit otherwise.
    fn active_unit(&self, path: &Path) -> String {
        match self.imgbase.config().volume_automount() {
            true => unit_name(path, "automount"),
            false => unit_name(path, "mount"),
        }
    }

    /// Move the content of the directory `path` onto a new volume of `size_bytes` and mount it
    /// there.
    pub async fn create(&self, path: &Path, size_bytes: u64) -> Result<LogicalVolume> {
        let runner = self.imgbase.runner();
        let lvm = self.imgbase.lvm();

        let is_dir = tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            bail!("{path:?} is not a directory");
        }
        if self.is_volume(path).await? {
            bail!(Error::AlreadyAVolume(path.to_path_buf()));
        }

        let name = encode(path)?;
        let pool = self.imgbase.layout().pool().await?;
        tracing::info!("Creating volume {name} of {size_bytes} bytes for {path:?}");
        let lv = lvm.create_thin(&pool, &name, size_bytes).await?;
        lvm.add_tag(&lv, TAG_VOLUME).await?;

        let kind = self.imgbase.config().volume_filesystem();
        kind.mkfs(runner, lv.path()).await?;
        {
            let target = Mounted::mount(runner, lv.path()).await?;
            let mut content = path.as_os_str().to_owned();
            content.push("/");
            rsync(runner, content, target.mount_point(), &[])
                .await
                .with_context(|| format!("Failed to move the content of {path:?} to {lv}"))?;
        }

        self.attach_lv(&lv, path).await?;
        self.imgbase
            .emit(Event::VolumeCreated {
                path: path.display().to_string(),
            })
            .await?;
        Ok(lv)
    }

    pub async fn remove(&self, path: &Path) -> Result<()> {
        let lv = self.lv_of(path).await?;
        self.detach(path).await?;
        tracing::info!("Removing volume {lv} of {path:?}");
        self.imgbase.lvm().remove(&lv).await?;
        self.imgbase
            .emit(Event::VolumeRemoved {
                path: path.display().to_string(),
            })
            .await
    }

    /// Write the units mounting the volume on `path`, then enable and start them.
    pub async fn attach(&self, path: &Path) -> Result<()> {
        let lv = self.lv_of(path).await?;
        self.attach_lv(&lv, path).await
    }

    async fn attach_lv(&self, lv: &LogicalVolume, path: &Path) -> Result<()> {
        let runner = self.imgbase.runner();
        let unit_dir = &self.imgbase.paths().unit_dir;

        write_file(
            runner,
            unit_dir.join(unit_name(path, "mount")),
            mount_unit(lv, path),
        )
        .await?;
        if self.imgbase.config().volume_automount() {
            write_file(
                runner,
                unit_dir.join(unit_name(path, "automount")),
                automount_unit(path),
            )
            .await?;
        }

        let unit = self.active_unit(path);
        runner.call("systemctl", ["daemon-reload"]).await?;
        runner
            .call("systemctl", ["enable", unit.as_str()])
            .await
            .with_context(|| format!("Failed to enable {unit}"))?;
        runner
            .call("systemctl", ["start", unit.as_str()])
            .await
            .with_context(|| format!("Failed to start {unit}"))?;
        tracing::info!("Volume {lv} is attached to {path:?}");
        Ok(())
    }

    /// Stop and disable the units of `path` and remove them. The volume stays.
    pub async fn detach(&self, path: &Path) -> Result<()> {
        self.lv_of(path).await?;
        let runner = self.imgbase.runner();
        let unit = self.active_unit(path);

        runner
            .call("systemctl", ["disable", unit.as_str()])
            .await
            .with_context(|| format!("Failed to disable {unit}"))?;
        runner
            .call("systemctl", ["stop", unit.as_str()])
            .await
            .with_context(|| format!("Failed to stop {unit}"))?;
        for name in self.units(path) {
            remove_path(runner, self.imgbase.paths().unit_dir.join(name)).await?;
        }
        runner.call("systemctl", ["daemon-reload"]).await?;
        tracing::info!("Detached the volume of {path:?}");
        Ok(())
    }
}

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};

use crate::{
    bootloader::Bootloader,
    config::{Config, ConfigSource},
    hooks::{Event, Hooks, ScriptListener},
    layout::Layout,
    lvm::Lvm,
    runner::Runner,
};

/// Host locations touched outside of the layer volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// The running root filesystem.
    pub root: PathBuf,
    pub boot: PathBuf,
    /// Where generated mount units for per-path volumes go.
    pub unit_dir: PathBuf,
    /// `.rpm` files deposited by package manager plugins, replayed into new layers.
    pub persisted_rpms: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            boot: PathBuf::from("/boot"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            persisted_rpms: PathBuf::from("/var/imgbased/persisted-rpms"),
        }
    }
}

impl HostPaths {
    /// All host paths below `prefix`, used to keep tests away from the real host.
    pub fn under(prefix: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        let defaults = Self::default();
        let rebase = |p: PathBuf| prefix.join(p.strip_prefix("/").unwrap_or(&p));
        Self {
            root: prefix.clone(),
            boot: rebase(defaults.boot),
            unit_dir: rebase(defaults.unit_dir),
            persisted_rpms: rebase(defaults.persisted_rpms),
        }
    }
}

/// Everything a top level operation needs: the runner, the loaded configuration, the hooks bus,
/// the bootloader and the host paths. Passed explicitly instead of living in globals.
pub struct Imgbase {
    runner: Runner,
    lvm: Lvm,
    config: Config,
    hooks: Hooks,
    bootloader: Bootloader,
    paths: HostPaths,
}

impl Imgbase {
    pub fn new(runner: Runner, config: Config, paths: HostPaths) -> Self {
        let mut hooks = Hooks::default();
        hooks.connect_any(Arc::new(ScriptListener::new(&runner, config.hooks_dir())));
        let bootloader = Bootloader::from_config(&runner, &config, &paths.boot);

        Self {
            lvm: Lvm::new(runner.clone()),
            runner,
            config,
            hooks,
            bootloader,
            paths,
        }
    }

    pub async fn load(
        runner: Runner,
        source: &dyn ConfigSource,
        paths: HostPaths,
    ) -> Result<Self> {
        let config = source.get_config().await.with_context(|| {
            format!("Failed to load config from {}", source.source_debug_string())
        })?;
        Ok(Self::new(runner, config, paths))
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn lvm(&self) -> &Lvm {
        &self.lvm
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    pub fn bootloader(&self) -> &Bootloader {
        &self.bootloader
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    pub fn layout(&self) -> Layout<'_> {
        Layout::new(self)
    }

    pub async fn emit(&self, event: Event) -> Result<()> {
        self.hooks.emit(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_under_prefix() {
        let paths = HostPaths::under("/tmp/host");
        assert_eq!(paths.root, PathBuf::from("/tmp/host"));
        assert_eq!(paths.boot, PathBuf::from("/tmp/host/boot"));
        assert_eq!(
            paths.persisted_rpms,
            PathBuf::from("/tmp/host/var/imgbased/persisted-rpms")
        );
    }
}

//! Carrying the state of the previous layer into a freshly created one.

pub mod accounts;
pub mod cpe;
pub mod etc;
pub mod kernel;

use std::path::Path;

use anyhow::{Context as _, Result};

use crate::{
    error::Error,
    fs::{mount::Mounted, write_file},
    hooks::Event,
    imgbase::Imgbase,
    lvm::LogicalVolume,
    meta::BuildMetadata,
    naming::Layer,
    runner::Invocation,
};

use self::{
    accounts::{reconcile, restore_ownership, Accounts},
    cpe::Cpe,
    kernel::{boot_uuid, compose_cmdline, find_kernel, place_kernel, regenerate_initramfs, PlacedKernel},
};

/// Marker in a root filesystem asking for first boot actions.
pub const FIRSTBOOT_MARKER: &str = ".imgbased-firstboot";

/// What a boot entry for the new layer needs, prepared while both trees were mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootPlan {
    pub title: String,
    pub kernel: PlacedKernel,
    pub cmdline: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub boot: Option<BootPlan>,
    /// Set when reinstalling persisted packages into the new layer failed.
    pub persisted_rpms_error: Option<String>,
}

pub struct Migration<'a> {
    imgbase: &'a Imgbase,
    previous: Layer,
    new: Layer,
}

impl<'a> Migration<'a> {
    pub fn new(imgbase: &'a Imgbase, previous: &Layer, new: &Layer) -> Self {
        Self {
            imgbase,
            previous: previous.clone(),
            new: new.clone(),
        }
    }

    /// Migrate, add a boot entry for the new layer and make it the default.
    pub async fn run(&self) -> Result<MigrationReport> {
        let report = self.migrate_tree().await?;
        if let Some(plan) = &report.boot {
            self.register_boot(plan).await?;
            self.set_default().await?;
        }
        self.announce().await?;
        Ok(report)
    }

    /// Everything that happens inside the two mounted trees: `/etc`, accounts, fstab, grub
    /// defaults, persisted packages and kernels.
    pub async fn migrate_tree(&self) -> Result<MigrationReport> {
        let runner = self.imgbase.runner();
        let layout = self.imgbase.layout();
        let prev_lv = layout.lv_of(&self.previous).await?;
        let new_lv = layout.lv_of(&self.new).await?;
        tracing::info!("Migrating from {} to {}", self.previous, self.new);

        let prev_mnt = Mounted::mount(runner, prev_lv.path()).await?;
        let new_mnt = Mounted::mount(runner, new_lv.path()).await?;
        let (prev_root, new_root) = (prev_mnt.mount_point(), new_mnt.mount_point());

        let same_product = self.check_stream(prev_root, new_root).await?;

        let reconcile_ids = self.imgbase.config().reconcile_ids();
        let new_accounts = match reconcile_ids {
            true => Some(Accounts::read(new_root).await?),
            false => None,
        };

        etc::migrate_etc(runner, prev_root, new_root, same_product).await?;
        if let Some(new_accounts) = new_accounts {
            self.reconcile_accounts(prev_root, new_root, &new_accounts)
                .await?;
        }
        etc::update_fstab(runner, new_root, &new_lv).await?;
        let grub_cmdline =
            etc::update_grub_defaults(runner, prev_root, new_root, &prev_lv, &new_lv).await?;

        let persisted_rpms_error = self.reinstall_persisted_rpms(new_root).await;
        write_file(runner, new_root.join(FIRSTBOOT_MARKER), "").await?;

        let boot = self
            .prepare_boot(new_root, &new_lv, grub_cmdline.as_deref())
            .await?;

        Ok(MigrationReport {
            boot,
            persisted_rpms_error,
        })
    }

    /// Fails unless both trees belong to an allowed product. Returns whether it is the same one.
    async fn check_stream(&self, prev_root: &Path, new_root: &Path) -> Result<bool> {
        let read = |root: &Path, layer: &Layer| {
            let root = root.to_path_buf();
            let layer = layer.clone();
            async move {
                let cpe = Cpe::of_root(&root)
                    .await?
                    .ok_or_else(|| Error::MigrationFailed(format!("{layer} carries no CPE")))?;
                if !cpe.is_allowed() {
                    anyhow::bail!(Error::MigrationFailed(format!(
                        "{layer} is {}, which cannot be migrated",
                        cpe.product
                    )));
                }
                Ok(cpe)
            }
        };
        let prev = read(prev_root, &self.previous).await?;
        let new = read(new_root, &self.new).await?;

        if prev.product != new.product {
            tracing::warn!(
                "Product changes from {} to {}, only the minimum of /etc is carried over",
                prev.product,
                new.product
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn reconcile_accounts(
        &self,
        prev_root: &Path,
        new_root: &Path,
        new_accounts: &Accounts,
    ) -> Result<()> {
        let runner = self.imgbase.runner();
        let prev_accounts = Accounts::read(prev_root).await?;
        let merged = reconcile(&prev_accounts, new_accounts)?;

        let etc = new_root.join("etc");
        for (name, content) in [
            ("passwd", &merged.passwd),
            ("group", &merged.group),
            ("shadow", &merged.shadow),
            ("gshadow", &merged.gshadow),
        ] {
            if !content.is_empty() {
                write_file(runner, etc.join(name), content).await?;
            }
        }
        restore_ownership(runner, new_root, &merged.uid_map, &merged.gid_map)
            .await
            .context("Failed to move files to the reconciled ids")?;
        Ok(())
    }

    /// Install the packages left by package manager plugins into the new tree. Failures are
    /// returned, not raised.
    async fn reinstall_persisted_rpms(&self, new_root: &Path) -> Option<String> {
        if !self.imgbase.config().reinstall_persisted_rpms() {
            return None;
        }
        let dir = &self.imgbase.paths().persisted_rpms;
        let pattern = dir.join("*.rpm");
        let rpms = glob::glob(&pattern.to_string_lossy())
            .map(|paths| paths.flatten().collect::<Vec<_>>())
            .unwrap_or_default();
        if rpms.is_empty() {
            return None;
        }

        tracing::info!("Reinstalling {} persisted packages", rpms.len());
        let invocation = Invocation::new("systemd-nspawn")
            .args(["--quiet", "--directory"])
            .arg(new_root)
            .arg("--bind")
            .arg(dir)
            .args(["yum", "install", "-y", "--noplugins"])
            .args(&rpms);
        match self.imgbase.runner().run(invocation).await {
            Ok(_) => None,
            Err(error) => {
                tracing::warn!("Failed to reinstall persisted packages: {error:#}");
                Some(format!("{error:#}"))
            }
        }
    }

    async fn prepare_boot(
        &self,
        new_root: &Path,
        new_lv: &LogicalVolume,
        grub_cmdline: Option<&str>,
    ) -> Result<Option<BootPlan>> {
        let runner = self.imgbase.runner();
        let Some(mut kernel) = find_kernel(runner, new_root).await? else {
            tracing::info!("No kernel found in {}, not adding a boot entry", self.new);
            return Ok(None);
        };
        if self.imgbase.config().regenerate_initramfs() || kernel.initramfs.is_none() {
            regenerate_initramfs(runner, new_root, &mut kernel).await?;
        }

        let boot = &self.imgbase.paths().boot;
        let placed = place_kernel(runner, new_root, boot, &self.new, &kernel).await?;
        let boot_uuid = boot_uuid(runner, boot).await?;
        let cmdline = compose_cmdline(grub_cmdline, new_lv, boot_uuid.as_deref());
        let title = match BuildMetadata::at(new_root).nvr().await? {
            Some(nvr) => nvr.to_string(),
            None => self.new.base_name(),
        };

        Ok(Some(BootPlan {
            title,
            kernel: placed,
            cmdline,
        }))
    }

    pub async fn register_boot(&self, plan: &BootPlan) -> Result<String> {
        self.imgbase
            .bootloader()
            .add(
                &self.new,
                &plan.title,
                &plan.kernel.vmlinuz,
                plan.kernel.initramfs.as_deref(),
                &plan.cmdline,
            )
            .await
    }

    pub async fn set_default(&self) -> Result<()> {
        self.imgbase.bootloader().set_default(&self.new).await
    }

    pub async fn announce(&self) -> Result<()> {
        self.imgbase
            .emit(Event::OsUpgraded {
                previous_lv: self.previous.lv_name(),
                new_lv: self.new.lv_name(),
            })
            .await
    }
}

//! Installing a new image as a base with a first layer, and making it the next boot.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _, Result};
use strum::Display;

use crate::{
    bootloader::BootEntry,
    error::Error,
    fs::{mkfs::FsKind, mount::Mounted, remove_path, sync::tar_copy},
    gc,
    imgbase::Imgbase,
    lvm::LogicalVolume,
    meta::BuildMetadata,
    migrate::Migration,
    naming::{Base, Image, Layer, Nvr},
};

const PHASES: usize = 9;

/// Progress of one update. Every state is reached only after the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum UpdateState {
    Idle,
    Located,
    Mounted,
    BaseCreated,
    BaseSealed,
    LayerCreated,
    Migrated,
    BootRegistered,
    Defaulted,
    Announced,
    Reported,
}

impl UpdateState {
    /// What is being done to leave this state, as shown when it fails.
    pub fn pending_step(&self) -> &'static str {
        match self {
            UpdateState::Idle => "finding the running layer",
            UpdateState::Located => "mounting the image",
            UpdateState::Mounted => "creating the base",
            UpdateState::BaseCreated => "populating the base",
            UpdateState::BaseSealed => "creating the layer",
            UpdateState::LayerCreated => "migrating the previous layer",
            UpdateState::Migrated => "adding the boot entry",
            UpdateState::BootRegistered => "setting the default boot entry",
            UpdateState::Defaulted => "announcing the upgrade",
            UpdateState::Announced => "freeing old bases",
            UpdateState::Reported => "cleaning up",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub base: Nvr,
    pub layer: Layer,
    pub bootid: Option<String>,
    pub persisted_rpms_error: Option<String>,
    pub freed: Vec<String>,
    pub gc_error: Option<String>,
    pub dry_run: bool,
}

pub struct Update<'a> {
    imgbase: &'a Imgbase,
    image: PathBuf,
    fallback_nvr: Option<Nvr>,
    state: UpdateState,
    /// Volumes created by this update, dropped again when it fails.
    registered: Vec<LogicalVolume>,
    new_layer: Option<Layer>,
    /// Loose kernels in `/boot` before the new one was placed.
    loose_kernels: Option<Vec<OsString>>,
    previous_default: Option<BootEntry>,
    default_changed: bool,
}

impl<'a> Update<'a> {
    pub fn new(imgbase: &'a Imgbase, image: impl Into<PathBuf>) -> Self {
        Self {
            imgbase,
            image: image.into(),
            fallback_nvr: None,
            state: UpdateState::Idle,
            registered: vec![],
            new_layer: None,
            loose_kernels: None,
            previous_default: None,
            default_changed: false,
        }
    }

    /// Used when the image does not carry build metadata.
    pub fn with_fallback_nvr(mut self, nvr: Option<Nvr>) -> Self {
        self.fallback_nvr = nvr;
        self
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    fn advance(&mut self, state: UpdateState) {
        tracing::debug!("Update state {} -> {state}", self.state);
        self.state = state;
    }

    /// Run the update. On failure the volumes created so far are removed and the error names the
    /// failing phase; the boot configuration is left as it was.
    pub async fn run(mut self) -> Result<UpdateReport> {
        match self.execute().await {
            Ok(report) => Ok(report),
            Err(error) => {
                let phase = self.state.pending_step();
                tracing::error!("Update failed while {phase}: {error:#}");
                self.abort().await;
                Err(Error::update_failed(phase, error).into())
            }
        }
    }

    async fn execute(&mut self) -> Result<UpdateReport> {
        let imgbase = self.imgbase;
        let runner = imgbase.runner();
        let layout = imgbase.layout();

        let current = layout
            .current_layer()
            .await
            .context("Updates start from a running layer")?;
        let current_lv = layout.current_lv().await?;
        self.advance(UpdateState::Located);

        tracing::info!("[ 1/{PHASES} ] Mounting the image {:?}", self.image);
        let outer = Mounted::mount_read_only(runner, &self.image).await?;
        let inner_image = find_inner_image(outer.mount_point())?;
        let inner = Mounted::mount_read_only(runner, &inner_image).await?;
        self.advance(UpdateState::Mounted);

        tracing::info!("[ 2/{PHASES} ] Creating the base");
        let nvr = match BuildMetadata::at(inner.mount_point()).nvr().await? {
            Some(nvr) => nvr,
            None => self.fallback_nvr.clone().with_context(|| {
                format!("The image {:?} carries no nvr and none was given", self.image)
            })?,
        };
        tracing::info!("Image is {nvr}, currently running {current}");
        let size = imgbase.lvm().size_bytes(&current_lv).await?;
        let kind = FsKind::detect(runner, current_lv.path()).await?;
        let base_lv = layout.add_base(&nvr, size).await?;
        self.registered.push(base_lv.clone());
        self.advance(UpdateState::BaseCreated);

        tracing::info!("[ 3/{PHASES} ] Copying the image into {base_lv} as {kind}");
        {
            let _unprotected = imgbase.lvm().unprotected(&base_lv).await?;
            kind.mkfs(runner, base_lv.path()).await?;
            let target = Mounted::mount(runner, base_lv.path()).await?;
            tar_copy(runner, inner.mount_point(), target.mount_point()).await?;
        }
        drop(inner);
        drop(outer);
        self.advance(UpdateState::BaseSealed);

        tracing::info!("[ 4/{PHASES} ] Creating the first layer of {nvr}");
        let layer = Layer::new(nvr.clone(), 1);
        let layer_lv = layout
            .create_layer(&Image::Base(Base::new(nvr.clone())), &layer)
            .await?;
        self.registered.push(layer_lv);
        self.new_layer = Some(layer.clone());
        self.advance(UpdateState::LayerCreated);

        if runner.is_dry_run() {
            tracing::info!("(dry-run) skipping migration, boot entries and garbage collection");
            return Ok(UpdateReport {
                base: nvr,
                layer,
                bootid: None,
                persisted_rpms_error: None,
                freed: vec![],
                gc_error: None,
                dry_run: true,
            });
        }

        tracing::info!("[ 5/{PHASES} ] Migrating {current} to {layer}");
        self.loose_kernels = Some(loose_kernels(&imgbase.paths().boot).await?);
        self.previous_default = imgbase.bootloader().get_default().await?;
        let migration = Migration::new(imgbase, &current, &layer);
        let migrated = migration.migrate_tree().await?;
        self.advance(UpdateState::Migrated);

        tracing::info!("[ 6/{PHASES} ] Adding a boot entry for {layer}");
        let bootid = match &migrated.boot {
            Some(plan) => Some(migration.register_boot(plan).await?),
            None => None,
        };
        self.advance(UpdateState::BootRegistered);

        tracing::info!("[ 7/{PHASES} ] Making {layer} the default");
        if bootid.is_some() {
            self.default_changed = true;
            migration.set_default().await?;
        } else {
            tracing::warn!("No boot entry for {layer}, the default is left alone");
        }
        self.advance(UpdateState::Defaulted);

        tracing::info!("[ 8/{PHASES} ] Announcing the upgrade");
        migration.announce().await?;
        self.advance(UpdateState::Announced);

        tracing::info!("[ 9/{PHASES} ] Freeing old bases");
        // the update stands from here on, garbage collection only reports
        let (freed, gc_error) = match gc::collect(imgbase, Some(&nvr)).await {
            Ok(freed) => (freed.iter().map(ToString::to_string).collect(), None),
            Err(error) => {
                tracing::warn!("Garbage collection failed: {error:#}");
                (vec![], Some(format!("{error:#}")))
            }
        };
        self.advance(UpdateState::Reported);

        Ok(UpdateReport {
            base: nvr,
            layer,
            bootid,
            persisted_rpms_error: migrated.persisted_rpms_error,
            freed,
            gc_error,
            dry_run: false,
        })
    }

    /// Drop what this update created, newest first, and put the previous default boot entry
    /// back. Failures are logged only, the original error is the one reported.
    async fn abort(&mut self) {
        let imgbase = self.imgbase;
        let bootloader = imgbase.bootloader();
        if let Some(layer) = &self.new_layer {
            if let Err(error) = bootloader.remove_entries_of(layer).await {
                tracing::error!("Failed to remove the boot entries of {layer}: {error:#}");
            }
        }
        if self.default_changed {
            match &self.previous_default {
                Some(previous) => {
                    if let Err(error) = bootloader.restore_default(previous).await {
                        tracing::error!("Failed to restore the default boot entry: {error:#}");
                    }
                }
                None => tracing::warn!("There was no default boot entry to restore"),
            }
        }
        if let Err(error) = self.remove_boot_files().await {
            tracing::error!("Failed to remove the kernels of the failed update: {error:#}");
        }
        while let Some(lv) = self.registered.pop() {
            tracing::info!("Removing {lv} created by the failed update");
            if let Err(error) = imgbase.lvm().remove(&lv).await {
                tracing::error!("Failed to remove {lv}, LVM has to reclaim it: {error:#}");
            }
        }
    }

    async fn remove_boot_files(&self) -> Result<()> {
        let runner = self.imgbase.runner();
        let boot = &self.imgbase.paths().boot;
        if let Some(layer) = &self.new_layer {
            remove_path(runner, boot.join(layer.to_string())).await?;
        }
        if let Some(before) = &self.loose_kernels {
            for name in loose_kernels(boot).await? {
                if !before.contains(&name) {
                    remove_path(runner, boot.join(name)).await?;
                }
            }
        }
        Ok(())
    }
}

/// Names of the `vmlinuz-*` files directly in `boot`.
async fn loose_kernels(boot: &Path) -> Result<Vec<OsString>> {
    let mut dir = match tokio::fs::read_dir(boot).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {boot:?}")),
    };
    let mut names = vec![];
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("vmlinuz-") {
            names.push(name);
        }
    }
    Ok(names)
}

/// The single filesystem image inside a mounted live image.
pub fn find_inner_image(root: &Path) -> Result<PathBuf> {
    let pattern = root.join("**").join("*.img");
    let mut found = glob::glob(&pattern.to_string_lossy())
        .context("Invalid image search pattern")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to search the image")?;
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => bail!("No filesystem image (*.img) found in {root:?}"),
        _ => bail!("More than one filesystem image found in {root:?}: {found:?}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::InMemoryConfigSource, hooks::handler, imgbase::HostPaths, runner::Runner,
        testutils::FakeHost,
    };

    #[tokio::test(flavor = "multi_thread")]
    async fn test_find_inner_image() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(find_inner_image(dir.path()).is_err());

        tokio::fs::create_dir_all(dir.path().join("LiveOS")).await?;
        tokio::fs::write(dir.path().join("LiveOS/rootfs.img"), "").await?;
        assert_eq!(
            find_inner_image(dir.path())?,
            dir.path().join("LiveOS/rootfs.img")
        );

        tokio::fs::write(dir.path().join("other.img"), "").await?;
        assert!(find_inner_image(dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(UpdateState::Idle < UpdateState::Mounted);
        assert!(UpdateState::Defaulted < UpdateState::Reported);
        assert_eq!(UpdateState::BaseCreated.to_string(), "base-created");
        assert_eq!(UpdateState::BaseCreated.pending_step(), "populating the base");
        assert_eq!(UpdateState::Defaulted.pending_step(), "announcing the upgrade");
        assert_eq!(UpdateState::Idle.pending_step(), "finding the running layer");
    }

    async fn host_with_layout(
        dir: &tempfile::TempDir,
        dry_run: bool,
    ) -> Result<(Arc<FakeHost>, Imgbase)> {
        let host = Arc::new(FakeHost::with_thin_root("hostvg", "pool0", "root", 10 << 30));
        let paths = HostPaths::under(dir.path().join("host"));
        let root = paths.root.to_string_lossy().into_owned();
        host.set_static_mount(&root, "/dev/hostvg/root", "rw,discard");

        let setup = Imgbase::load(
            Runner::with_executor(host.clone(), false),
            &InMemoryConfigSource::new(""),
            paths.clone(),
        )
        .await?;
        setup
            .layout()
            .init_from("hostvg/root", &"Image-1.0-0".parse()?)
            .await?;
        host.set_static_mount(&root, "/dev/hostvg/Image-1.0-0+1", "rw,discard");

        let outer = dir.path().join("outer");
        tokio::fs::create_dir_all(outer.join("LiveOS")).await?;
        tokio::fs::write(outer.join("LiveOS/rootfs.img"), "").await?;
        host.add_mount_fixture("update.squashfs", &outer);
        let inner = dir.path().join("inner");
        tokio::fs::create_dir_all(inner.join(crate::meta::META_DIR)).await?;
        tokio::fs::write(inner.join(crate::meta::META_DIR).join("nvr"), "Image-2.0-0").await?;
        host.add_mount_fixture("rootfs.img", &inner);

        let imgbase = Imgbase::load(
            Runner::with_executor(host.clone(), dry_run),
            &InMemoryConfigSource::new(""),
            paths,
        )
        .await?;
        host.clear_calls();
        Ok((host, imgbase))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dry_run_changes_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (host, imgbase) = host_with_layout(&dir, true).await?;
        let before = host.lv_names("hostvg");

        let report = Update::new(&imgbase, dir.path().join("update.squashfs"))
            .run()
            .await?;
        assert!(report.dry_run);
        assert_eq!(report.layer.to_string(), "Image-2.0-0+1");
        assert_eq!(host.lv_names("hostvg"), before);
        assert!(host.calls_of("lvcreate").is_empty());
        assert!(host.mounts().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_removes_created_volumes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (host, imgbase) = host_with_layout(&dir, false).await?;
        host.fail_on("bash -c");

        let error = Update::new(&imgbase, dir.path().join("update.squashfs"))
            .run()
            .await
            .unwrap_err();
        match Error::find(&error) {
            Some(Error::UpdateFailed { phase, .. }) => assert_eq!(phase, "populating the base"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            host.lv_names("hostvg"),
            ["Image-1.0-0", "Image-1.0-0+1", "pool0"]
        );
        assert!(host.mounts().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_subscriber_leaves_no_base() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (host, mut imgbase) = host_with_layout(&dir, false).await?;
        imgbase.hooks_mut().connect(
            "new-base-added",
            handler(1, |_| async { Err(anyhow::anyhow!("base subscriber failed")) }),
        )?;

        let error = Update::new(&imgbase, dir.path().join("update.squashfs"))
            .run()
            .await
            .unwrap_err();
        match Error::find(&error) {
            Some(Error::UpdateFailed { phase, .. }) => assert_eq!(phase, "creating the base"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            host.lv_names("hostvg"),
            ["Image-1.0-0", "Image-1.0-0+1", "pool0"]
        );
        assert!(host.mounts().is_empty());
        Ok(())
    }
}

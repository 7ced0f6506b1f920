pub mod base;
pub mod boot;
pub mod check;
pub mod firstboot;
pub mod layer;
pub mod layout;
pub mod recover;
pub mod rollback;
pub mod update;
pub mod volume;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use imgbased::{
    config::{ConfigSource as _, FileSystemConfigSource},
    naming::{Layer, Nvr},
    runner::Runner,
    Error, HostPaths, Imgbase,
};

use crate::cli::{Cli, GlobalOptions, ImgbaseSubcommand};
use base::BaseCommand;
use boot::BootCommand;
use check::CheckCommand;
use firstboot::FirstbootCommand;
use layer::LayerCommand;
use layout::LayoutCommand;
use recover::RecoverCommand;
use rollback::RollbackCommand;
use update::UpdateCommand;
use volume::VolumeCommand;

#[async_trait]
pub trait Command {
    async fn run(&self) -> Result<()>;
}

pub trait IntoCommand {
    fn into_command(self) -> Box<dyn Command>;
}

/// A subcommand working on the host described by an [`Imgbase`].
///
/// Whatever is written to `out` goes to stdout, also when the command fails.
#[async_trait]
pub trait HostCommand: Send + Sync {
    async fn execute(&self, imgbase: &Imgbase, out: &mut String) -> Result<()>;
}

/// Loads the host from the global options, then runs `command` on it.
pub struct OnHost<C> {
    pub global: GlobalOptions,
    pub command: C,
}

#[async_trait]
impl<C: HostCommand> Command for OnHost<C> {
    async fn run(&self) -> Result<()> {
        let imgbase = load_imgbase(&self.global).await?;
        let mut out = String::new();
        let result = self.command.execute(&imgbase, &mut out).await;
        if !out.is_empty() {
            println!("{}", out.trim_end());
        }
        result
    }
}

pub async fn load_imgbase(global: &GlobalOptions) -> Result<Imgbase> {
    let source = match &global.config_dir {
        Some(dir) => {
            if !dir.is_dir() {
                bail!("Config dir {dir:?} does not exist or not a directory");
            }
            FileSystemConfigSource::with_config_dir(dir)
        }
        None => FileSystemConfigSource::new_with_default_paths(),
    };
    tracing::debug!("Using config source from {}", source.source_debug_string());

    if global.dry {
        tracing::info!("Running in dry-run mode, nothing on the host is changed");
    }
    Imgbase::load(Runner::system(global.dry), &source, HostPaths::default()).await
}

/// `spec` is either a layer name or the NVR of a base, which stands for its latest layer.
pub async fn resolve_layer(imgbase: &Imgbase, spec: &str) -> Result<Layer> {
    let tree = imgbase.layout().tree().await?;
    if spec.contains('+') {
        let layer = spec.parse::<Layer>()?;
        if !tree.contains_layer(&layer) {
            bail!(Error::NoValidLayout(format!("{layer} is not part of the layout")));
        }
        return Ok(layer);
    }

    let nvr = spec.parse::<Nvr>()?;
    tree.base(&nvr)
        .with_context(|| format!("There is no base {nvr}"))?
        .latest_layer()
        .cloned()
        .with_context(|| format!("The base {nvr} has no layers"))
}

impl IntoCommand for Cli {
    fn into_command(self) -> Box<dyn Command> {
        let global = self.global;
        match self.command {
            ImgbaseSubcommand::Layout(layout_options) => Box::new(OnHost {
                global,
                command: LayoutCommand { layout_options },
            }),
            ImgbaseSubcommand::Base(base_options) => Box::new(OnHost {
                global,
                command: BaseCommand { base_options },
            }),
            ImgbaseSubcommand::Layer(layer_options) => Box::new(OnHost {
                global,
                command: LayerCommand { layer_options },
            }),
            ImgbaseSubcommand::Update(update_options) => Box::new(OnHost {
                global,
                command: UpdateCommand { update_options },
            }),
            ImgbaseSubcommand::Rollback(rollback_options) => Box::new(OnHost {
                global,
                command: RollbackCommand { rollback_options },
            }),
            ImgbaseSubcommand::Check(check_options) => Box::new(OnHost {
                global,
                command: CheckCommand { check_options },
            }),
            ImgbaseSubcommand::Recover(recover_options) => Box::new(OnHost {
                global,
                command: RecoverCommand { recover_options },
            }),
            ImgbaseSubcommand::Boot(boot_options) => Box::new(OnHost {
                global,
                command: BootCommand { boot_options },
            }),
            ImgbaseSubcommand::Volume(volume_options) => Box::new(OnHost {
                global,
                command: VolumeCommand { volume_options },
            }),
            ImgbaseSubcommand::Firstboot(_) => Box::new(OnHost {
                global,
                command: FirstbootCommand,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use imgbased::{config::InMemoryConfigSource, testutils::FakeHost};

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolve_layer() -> Result<()> {
        let host = Arc::new(FakeHost::with_thin_root("hostvg", "pool0", "root", 10 << 30));
        let dir = tempfile::tempdir()?;
        let paths = HostPaths::under(dir.path());
        let root = paths.root.to_string_lossy().into_owned();
        host.set_static_mount(&root, "/dev/hostvg/root", "rw");
        let imgbase = Imgbase::load(
            Runner::with_executor(host.clone(), false),
            &InMemoryConfigSource::new(""),
            paths,
        )
        .await?;
        let layout = imgbase.layout();
        layout
            .init_from("hostvg/root", &"Image-1.0-0".parse()?)
            .await?;
        host.set_static_mount(&root, "/dev/hostvg/Image-1.0-0+1", "rw");
        layout.add_layer(None).await?;
        layout.add_base(&"Image-2.0-0".parse()?, 1 << 30).await?;

        assert_eq!(
            resolve_layer(&imgbase, "Image-1.0-0").await?.to_string(),
            "Image-1.0-0+2"
        );
        assert_eq!(
            resolve_layer(&imgbase, "Image-1.0-0+1").await?.to_string(),
            "Image-1.0-0+1"
        );
        assert!(resolve_layer(&imgbase, "Image-1.0-0+7").await.is_err());
        assert!(resolve_layer(&imgbase, "Image-2.0-0").await.is_err());
        assert!(resolve_layer(&imgbase, "Image-3.0-0").await.is_err());
        Ok(())
    }
}

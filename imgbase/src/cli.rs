use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: ImgbaseSubcommand,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalOptions {
    /// Only print what would change. Queries still run.
    #[clap(long, global = true)]
    pub dry: bool,

    /// Log at debug level.
    #[clap(long, global = true)]
    pub debug: bool,

    /// Directory holding imgbased.conf and imgbased.conf.d/. Default value is /etc.
    #[clap(long, short = 'c', global = true)]
    pub config_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum ImgbaseSubcommand {
    /// Show or initialize the layout.
    #[command(name = "layout")]
    Layout(LayoutOptions),

    /// Manage bases.
    #[command(name = "base")]
    Base(BaseOptions),

    /// Manage layers.
    #[command(name = "layer")]
    Layer(LayerOptions),

    /// Install an image as a new base and boot into its first layer on the next reboot.
    #[command(name = "update")]
    Update(UpdateOptions),

    /// Boot an earlier layer on the next reboot.
    #[command(name = "rollback")]
    Rollback(RollbackOptions),

    /// Check the health of the layout.
    #[command(name = "check")]
    Check(CheckOptions),

    /// List or remove what failed updates left behind.
    #[command(name = "recover")]
    Recover(RecoverOptions),

    /// Inspect and change boot entries.
    #[command(name = "boot")]
    Boot(BootOptions),

    /// Manage per-path volumes kept across updates.
    #[command(name = "volume")]
    Volume(VolumeOptions),

    /// Run the first boot jobs of a freshly migrated layer.
    #[command(name = "firstboot")]
    Firstboot(FirstbootOptions),
}

#[derive(Parser, Debug, Clone, Default)]
#[command(group(ArgGroup::new("action").args(["init_nvr", "bases", "layers", "free_space"])))]
pub struct LayoutOptions {
    /// Create a layout with this NVR from an existing thin volume.
    #[clap(long, requires = "from")]
    pub init_nvr: Option<String>,

    /// The thin volume to initialize from, as VG/LV.
    #[clap(long, requires = "init_nvr")]
    pub from: Option<String>,

    /// List the bases.
    #[clap(long)]
    pub bases: bool,

    /// List the layers.
    #[clap(long)]
    pub layers: bool,

    /// Print the free space of the thin pool in bytes.
    #[clap(long)]
    pub free_space: bool,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(group(ArgGroup::new("action").required(true).args(["add", "latest", "remove", "of_layer"])))]
pub struct BaseOptions {
    /// Add an empty base with this NVR.
    #[clap(long, requires = "size")]
    pub add: Option<String>,

    /// Size of the added base, with an optional K, M, G or T suffix.
    #[clap(long, requires = "add")]
    pub size: Option<String>,

    /// Print the latest base.
    #[clap(long)]
    pub latest: bool,

    /// Remove a base together with its layers.
    #[clap(long)]
    pub remove: Option<String>,

    /// Print the base of a layer.
    #[clap(long)]
    pub of_layer: Option<String>,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(group(ArgGroup::new("action").required(true).args(["add", "latest", "current"])))]
pub struct LayerOptions {
    /// Add a layer on top of the given base or layer, or on top of the latest layer.
    #[clap(long, num_args = 0..=1, value_name = "IMAGE")]
    pub add: Option<Option<String>>,

    /// Print the latest layer.
    #[clap(long)]
    pub latest: bool,

    /// Print the running layer.
    #[clap(long)]
    pub current: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct UpdateOptions {
    /// The live image to install.
    pub image: PathBuf,

    /// NVR to use when the image carries none.
    #[clap(long)]
    pub nvr: Option<String>,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct RollbackOptions {
    /// Roll back to the latest layer of this base instead of the previous layer.
    #[clap(long)]
    pub to: Option<String>,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct CheckOptions {
    /// Output as JSON format instead of table
    #[clap(long)]
    pub json: bool,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(group(ArgGroup::new("action").args(["list", "force"])))]
pub struct RecoverOptions {
    /// List the leftovers. This is the default.
    #[clap(long)]
    pub list: bool,

    /// Remove the leftovers.
    #[clap(long)]
    pub force: bool,

    /// Skip confirmation prompts.
    #[clap(long, short = 'y', default_value = "false")]
    pub yes: bool,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(group(ArgGroup::new("action").args(["list", "get_default", "set_default", "remove_other_boot_entries"])))]
pub struct BootOptions {
    /// List the boot entries. This is the default.
    #[clap(long)]
    pub list: bool,

    /// Output as JSON format instead of table
    #[clap(long)]
    pub json: bool,

    /// Print the default boot entry.
    #[clap(long)]
    pub get_default: bool,

    /// Boot this layer, or the latest layer of this base, by default.
    #[clap(long, value_name = "IMAGE")]
    pub set_default: Option<String>,

    /// Remove every entry not booting a layer of the layout.
    #[clap(long)]
    pub remove_other_boot_entries: bool,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(group(ArgGroup::new("action").args(["list", "create", "remove", "attach", "detach"])))]
pub struct VolumeOptions {
    /// List the paths backed by a volume. This is the default.
    #[clap(long)]
    pub list: bool,

    /// Move a directory onto a new volume of the given size.
    #[clap(long, num_args = 2, value_names = ["PATH", "SIZE"])]
    pub create: Option<Vec<String>>,

    /// Remove the volume of a path.
    #[clap(long, value_name = "PATH")]
    pub remove: Option<PathBuf>,

    /// Mount the volume of a path through systemd.
    #[clap(long, value_name = "PATH")]
    pub attach: Option<PathBuf>,

    /// Stop mounting the volume of a path.
    #[clap(long, value_name = "PATH")]
    pub detach: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct FirstbootOptions {}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["imgbase", "layout", "--bases"])]
    #[case(&["imgbase", "--dry", "layout", "--init-nvr", "Image-1.0-0", "--from", "hostvg/root"])]
    #[case(&["imgbase", "base", "--add", "Image-42-0", "--size", "4096"])]
    #[case(&["imgbase", "layer", "--add"])]
    #[case(&["imgbase", "layer", "--add", "Image-42-0"])]
    #[case(&["imgbase", "volume", "--create", "/var/log", "10G"])]
    #[case(&["imgbase", "boot", "--list", "--json", "--debug"])]
    #[case(&["imgbase", "recover", "--force", "-y"])]
    fn test_parse(#[case] argv: &[&str]) {
        assert!(Cli::try_parse_from(argv).is_ok(), "{argv:?}");
    }

    #[rstest]
    #[case(&["imgbase", "layout", "--init-nvr", "Image-1.0-0"])]
    #[case(&["imgbase", "layout", "--bases", "--layers"])]
    #[case(&["imgbase", "base", "--add", "Image-42-0"])]
    #[case(&["imgbase", "base"])]
    #[case(&["imgbase", "volume", "--create", "/var/log"])]
    #[case(&["imgbase", "recover", "--list", "--force"])]
    fn test_parse_rejects(#[case] argv: &[&str]) {
        assert!(Cli::try_parse_from(argv).is_err(), "{argv:?}");
    }

    #[test]
    fn test_layer_add_without_image() {
        let cli = Cli::try_parse_from(["imgbase", "layer", "--add"]).unwrap();
        match cli.command {
            ImgbaseSubcommand::Layer(options) => assert_eq!(options.add, Some(None)),
            other => panic!("unexpected subcommand {other:?}"),
        }
    }
}

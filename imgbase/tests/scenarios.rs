// End to end runs of the imgbase subcommands against an in-memory host

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as _, Result};
use imgbase::{
    cli::{
        BaseOptions, BootOptions, LayerOptions, LayoutOptions, RecoverOptions, RollbackOptions,
        UpdateOptions, VolumeOptions,
    },
    cmd::{
        base::BaseCommand, boot::BootCommand, layer::LayerCommand, layout::LayoutCommand,
        recover::RecoverCommand, rollback::RollbackCommand, update::UpdateCommand,
        volume::VolumeCommand, HostCommand,
    },
};
use imgbased::{
    config::InMemoryConfigSource,
    hooks::handler,
    meta::META_DIR,
    naming::{Image, Layer},
    runner::Runner,
    testutils::FakeHost,
    Error, HostPaths, Imgbase,
};
use tempfile::TempDir;

#[ctor::ctor]
fn init() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

struct TestHost {
    dir: TempDir,
    host: Arc<FakeHost>,
    paths: HostPaths,
}

impl TestHost {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let host = Arc::new(FakeHost::with_thin_root("hostvg", "pool0", "root", 10 << 30));
        let paths = HostPaths::under(dir.path().join("host"));
        let test_host = Self { dir, host, paths };
        test_host.boot_into("root");
        Ok(test_host)
    }

    /// Pretend the host rebooted into `lv`.
    fn boot_into(&self, lv: &str) {
        self.host.set_static_mount(
            &self.paths.root.to_string_lossy(),
            &format!("/dev/hostvg/{lv}"),
            "rw,relatime,discard",
        );
    }

    async fn imgbase(&self) -> Result<Imgbase> {
        self.imgbase_with(false).await
    }

    async fn imgbase_with(&self, dry_run: bool) -> Result<Imgbase> {
        let config = format!(
            "[bootloader]\nkind = bls\nentries = {}\n",
            self.dir.path().join("loader/entries").display()
        );
        Imgbase::load(
            Runner::with_executor(self.host.clone(), dry_run),
            &InMemoryConfigSource::new(config),
            self.paths.clone(),
        )
        .await
    }

    async fn initialized(&self) -> Result<Imgbase> {
        let imgbase = self.imgbase().await?;
        execute(
            &LayoutCommand {
                layout_options: LayoutOptions {
                    init_nvr: Some("Image-1.0-0".into()),
                    from: Some("hostvg/root".into()),
                    ..Default::default()
                },
            },
            &imgbase,
        )
        .await?;
        self.boot_into("Image-1.0-0+1");
        Ok(imgbase)
    }

    /// A tree for the mount fixture matching `source_suffix`.
    async fn fixture(&self, source_suffix: &str, files: &[(&str, &str)]) -> Result<()> {
        let root = self.dir.path().join("fixtures").join(source_suffix);
        for (path, content) in files {
            let path = root.join(path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, content).await?;
        }
        tokio::fs::create_dir_all(&root).await?;
        self.host.add_mount_fixture(source_suffix, &root);
        Ok(())
    }
}

async fn execute(command: &impl HostCommand, imgbase: &Imgbase) -> Result<String> {
    let mut out = String::new();
    command.execute(imgbase, &mut out).await?;
    Ok(out)
}

fn lines(out: &str) -> Vec<&str> {
    out.lines().collect()
}

/// Every path below `dir` with the content of the files, sorted by path.
fn files_below(dir: &Path) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    let mut files = vec![];
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                files.push((path.clone(), vec![]));
                pending.push(path);
            } else {
                let content = std::fs::read(&path)?;
                files.push((path, content));
            }
        }
    }
    files.sort();
    Ok(files)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_init_from_existing_root() -> Result<()> {
    let test_host = TestHost::new()?;
    let imgbase = test_host.imgbase().await?;

    let out = execute(
        &LayoutCommand {
            layout_options: LayoutOptions {
                init_nvr: Some("Image-1.0-0".into()),
                from: Some("hostvg/root".into()),
                ..Default::default()
            },
        },
        &imgbase,
    )
    .await?;
    assert_eq!(lines(&out), ["Image-1.0-0+1"]);

    let host = &test_host.host;
    assert_eq!(
        host.lv_names("hostvg"),
        ["Image-1.0-0", "Image-1.0-0+1", "pool0"]
    );
    let base = host.lv("hostvg", "Image-1.0-0").context("base missing")?;
    assert!(!base.writable && !base.active);
    let layer = host.lv("hostvg", "Image-1.0-0+1").context("layer missing")?;
    assert!(layer.writable && layer.active);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_layout_listings() -> Result<()> {
    let test_host = TestHost::new()?;
    let imgbase = test_host.initialized().await?;

    let listing = |bases: bool, layers: bool| LayoutCommand {
        layout_options: LayoutOptions {
            bases,
            layers,
            ..Default::default()
        },
    };
    assert_eq!(
        lines(&execute(&listing(true, false), &imgbase).await?),
        ["Image-1.0-0"]
    );
    assert_eq!(
        lines(&execute(&listing(false, true), &imgbase).await?),
        ["Image-1.0-0+1"]
    );

    let tree = execute(&listing(false, false), &imgbase).await?;
    assert_eq!(lines(&tree), ["Image-1.0-0", " └╼ Image-1.0-0+1 (running)"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_base_then_layer() -> Result<()> {
    let test_host = TestHost::new()?;
    let imgbase = test_host.initialized().await?;

    let out = execute(
        &BaseCommand {
            base_options: BaseOptions {
                add: Some("Image-42-0".into()),
                size: Some("4096".into()),
                ..Default::default()
            },
        },
        &imgbase,
    )
    .await?;
    assert_eq!(lines(&out), ["Image-42-0"]);

    let add_layer = |target: Option<&str>| LayerCommand {
        layer_options: LayerOptions {
            add: Some(target.map(ToOwned::to_owned)),
            ..Default::default()
        },
    };
    let out = execute(&add_layer(Some("Image-42-0")), &imgbase).await?;
    assert_eq!(lines(&out), ["Image-42-0+1"]);

    let error = execute(&add_layer(None), &imgbase).await.unwrap_err();
    assert!(
        matches!(Error::find(&error), Some(Error::LayerOutOfOrder(_))),
        "{error:#}"
    );

    let of_layer = execute(
        &BaseCommand {
            base_options: BaseOptions {
                of_layer: Some("Image-42-0+1".into()),
                ..Default::default()
            },
        },
        &imgbase,
    )
    .await?;
    assert_eq!(lines(&of_layer), ["Image-42-0"]);
    Ok(())
}

#[test]
fn test_nvr_ordering() -> Result<()> {
    let mut images = ["Image-1-0", "Image-13-0", "Image-2-0+1", "Image-2-0"]
        .iter()
        .map(|name| name.parse::<Image>())
        .collect::<Result<Vec<_>>>()?;
    images.sort();
    let sorted = images.iter().map(ToString::to_string).collect::<Vec<_>>();
    assert_eq!(sorted, ["Image-1-0", "Image-2-0", "Image-2-0+1", "Image-13-0"]);
    Ok(())
}

async fn prepare_update(test_host: &TestHost) -> Result<()> {
    const CPE: &str = "cpe:/o:centos:centos:8\n";
    let nvr_file = format!("{META_DIR}/nvr");

    test_host
        .fixture("update.squashfs", &[("LiveOS/rootfs.img", "")])
        .await?;
    test_host
        .fixture("rootfs.img", &[(nvr_file.as_str(), "Image-2.0-0")])
        .await?;
    test_host
        .fixture(
            "Image-1.0-0+1",
            &[
                ("etc/system-release-cpe", CPE),
                (
                    "etc/default/grub",
                    "GRUB_CMDLINE_LINUX=\"crashkernel=auto rd.lvm.lv=hostvg/Image-1.0-0+1\"\n",
                ),
            ],
        )
        .await?;
    test_host
        .fixture(
            "Image-2.0-0+1",
            &[
                ("etc/system-release-cpe", CPE),
                ("boot/vmlinuz-5.14", "kernel"),
                ("boot/initramfs-5.14.img", "initrd"),
                (nvr_file.as_str(), "Image-2.0-0"),
            ],
        )
        .await?;
    test_host.host.add_package(
        "kernel-core-5.14-1.x86_64",
        &["kernel"],
        &["/boot/vmlinuz-5.14", "/boot/initramfs-5.14.img"],
    );
    Ok(())
}

async fn update(test_host: &TestHost, imgbase: &Imgbase) -> Result<String> {
    execute(
        &UpdateCommand {
            update_options: UpdateOptions {
                image: test_host.dir.path().join("update.squashfs"),
                nvr: None,
            },
        },
        imgbase,
    )
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_success() -> Result<()> {
    let test_host = TestHost::new()?;
    let imgbase = test_host.initialized().await?;
    prepare_update(&test_host).await?;

    let bootloader = imgbase.bootloader();
    let first: Layer = "Image-1.0-0+1".parse()?;
    let first_id = bootloader
        .add(&first, "Image-1.0-0", "/Image-1.0-0+1/vmlinuz-5.14", None, "ro")
        .await?;
    bootloader.set_default(&first).await?;

    let out = update(&test_host, &imgbase).await?;
    assert!(out.contains("Installed Image-2.0-0 as Image-2.0-0+1"), "{out}");

    let host = &test_host.host;
    assert_eq!(
        host.lv_names("hostvg"),
        ["Image-1.0-0", "Image-1.0-0+1", "Image-2.0-0", "Image-2.0-0+1", "pool0"]
    );
    assert!(host.mounts().is_empty());

    let new: Layer = "Image-2.0-0+1".parse()?;
    let entry = bootloader.entry_of(&new).await?.context("no boot entry")?;
    let bootid = entry.bootid.clone().context("no bootid")?;
    assert_ne!(bootid, first_id);
    assert!(entry.cmdline.contains("root=/dev/hostvg/Image-2.0-0+1"));
    assert!(entry.cmdline.contains("rd.lvm.lv=hostvg/Image-2.0-0+1"));

    let default = bootloader.get_default().await?.context("no default")?;
    assert_eq!(default.bootid.as_deref(), Some(bootid.as_str()));
    assert_eq!(default.layer.as_deref(), Some("Image-2.0-0+1"));

    let boot = &test_host.paths.boot;
    assert!(boot.join("Image-2.0-0+1/vmlinuz-5.14").exists());
    assert!(boot.join("Image-2.0-0+1/initramfs-5.14.img").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rollback_after_update() -> Result<()> {
    let test_host = TestHost::new()?;
    let imgbase = test_host.initialized().await?;
    prepare_update(&test_host).await?;

    let bootloader = imgbase.bootloader();
    let first: Layer = "Image-1.0-0+1".parse()?;
    let first_id = bootloader
        .add(&first, "Image-1.0-0", "/Image-1.0-0+1/vmlinuz-5.14", None, "ro")
        .await?;
    bootloader.set_default(&first).await?;
    update(&test_host, &imgbase).await?;
    test_host.boot_into("Image-2.0-0+1");
    let lvs = test_host.host.lv_names("hostvg");

    let out = execute(
        &RollbackCommand {
            rollback_options: RollbackOptions::default(),
        },
        &imgbase,
    )
    .await?;
    assert_eq!(lines(&out), ["Image-1.0-0+1 boots on the next reboot"]);

    let default = bootloader.get_default().await?.context("no default")?;
    assert_eq!(default.bootid.as_deref(), Some(first_id.as_str()));
    assert_eq!(test_host.host.lv_names("hostvg"), lvs);

    let get_default = execute(
        &BootCommand {
            boot_options: BootOptions {
                get_default: true,
                ..Default::default()
            },
        },
        &imgbase,
    )
    .await?;
    assert_eq!(lines(&get_default), ["Image-1.0-0+1"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_update_leaves_nothing_to_recover() -> Result<()> {
    let test_host = TestHost::new()?;
    let imgbase = test_host.initialized().await?;
    prepare_update(&test_host).await?;
    test_host.host.fail_on("bash -c");

    let error = update(&test_host, &imgbase).await.unwrap_err();
    assert!(matches!(
        Error::find(&error),
        Some(Error::UpdateFailed { .. })
    ));
    assert_eq!(
        test_host.host.lv_names("hostvg"),
        ["Image-1.0-0", "Image-1.0-0+1", "pool0"]
    );

    let listed = execute(
        &RecoverCommand {
            recover_options: RecoverOptions {
                list: true,
                ..Default::default()
            },
        },
        &imgbase,
    )
    .await?;
    assert!(listed.is_empty(), "{listed}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_failing_late_keeps_boot_configuration() -> Result<()> {
    let test_host = TestHost::new()?;
    let mut imgbase = test_host.initialized().await?;
    prepare_update(&test_host).await?;
    imgbase.hooks_mut().connect(
        "os-upgraded",
        handler(2, |_| async { Err(anyhow::anyhow!("upgrade subscriber failed")) }),
    )?;

    let bootloader = imgbase.bootloader();
    let first: Layer = "Image-1.0-0+1".parse()?;
    let first_id = bootloader
        .add(&first, "Image-1.0-0", "/Image-1.0-0+1/vmlinuz-5.14", None, "ro")
        .await?;
    bootloader.set_default(&first).await?;

    let error = update(&test_host, &imgbase).await.unwrap_err();
    match Error::find(&error) {
        Some(Error::UpdateFailed { phase, .. }) => assert_eq!(phase, "announcing the upgrade"),
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(
        test_host.host.lv_names("hostvg"),
        ["Image-1.0-0", "Image-1.0-0+1", "pool0"]
    );
    let default = bootloader.get_default().await?.context("no default")?;
    assert_eq!(default.bootid.as_deref(), Some(first_id.as_str()));
    assert_eq!(bootloader.entries().await?.len(), 1);

    let boot = &test_host.paths.boot;
    assert!(!boot.join("Image-2.0-0+1").exists());
    assert!(!boot.join("vmlinuz-5.14").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_boot_set_default_and_remove_others() -> Result<()> {
    let test_host = TestHost::new()?;
    let imgbase = test_host.initialized().await?;
    let layout = imgbase.layout();
    layout.add_base(&"Image-2.0-0".parse()?, 1 << 30).await?;
    let second = layout.add_layer(Some(&"Image-2.0-0".parse()?)).await?;

    let bootloader = imgbase.bootloader();
    let first: Layer = "Image-1.0-0+1".parse()?;
    bootloader
        .add(&first, "Image-1.0-0", "/Image-1.0-0+1/vmlinuz-5.14", None, "ro")
        .await?;
    bootloader
        .add(&second, "Image-2.0-0", "/Image-2.0-0+1/vmlinuz-5.14", None, "ro")
        .await?;
    bootloader
        .add(&"Image-9.0-0+1".parse()?, "Stale", "/Image-9.0-0+1/vmlinuz-5.14", None, "ro")
        .await?;

    let boot = |options: BootOptions| BootCommand {
        boot_options: options,
    };
    let out = execute(
        &boot(BootOptions {
            set_default: Some("Image-2.0-0".into()),
            ..Default::default()
        }),
        &imgbase,
    )
    .await?;
    assert_eq!(lines(&out), ["Image-2.0-0+1 boots on the next reboot"]);
    let default = bootloader.get_default().await?.context("no default")?;
    assert_eq!(default.layer.as_deref(), Some("Image-2.0-0+1"));

    let out = execute(
        &boot(BootOptions {
            remove_other_boot_entries: true,
            ..Default::default()
        }),
        &imgbase,
    )
    .await?;
    assert_eq!(lines(&out).len(), 1);
    assert_eq!(bootloader.entries().await?.len(), 2);

    let json = execute(
        &boot(BootOptions {
            list: true,
            json: true,
            ..Default::default()
        }),
        &imgbase,
    )
    .await?;
    let entries: serde_json::Value = serde_json::from_str(&json)?;
    assert_eq!(entries.as_array().map(Vec::len), Some(2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dry_run_changes_nothing() -> Result<()> {
    let test_host = TestHost::new()?;
    let imgbase = test_host.initialized().await?;
    let layout = imgbase.layout();
    layout.add_base(&"Image-2.0-0".parse()?, 1 << 30).await?;
    let second = layout.add_layer(Some(&"Image-2.0-0".parse()?)).await?;
    layout.add_base(&"Image-3.0-0".parse()?, 1 << 30).await?;
    layout.add_layer(Some(&"Image-3.0-0".parse()?)).await?;

    let bootloader = imgbase.bootloader();
    let first: Layer = "Image-1.0-0+1".parse()?;
    bootloader
        .add(&first, "Image-1.0-0", "/Image-1.0-0+1/vmlinuz-5.14", None, "ro")
        .await?;
    bootloader
        .add(&second, "Image-2.0-0", "/Image-2.0-0+1/vmlinuz-5.14", None, "ro")
        .await?;
    bootloader.set_default(&second).await?;
    test_host.boot_into("Image-2.0-0+1");

    let boot = &test_host.paths.boot;
    for layer in ["Image-1.0-0+1", "Image-2.0-0+1", "Image-3.0-0+1"] {
        tokio::fs::create_dir_all(boot.join(layer)).await?;
        tokio::fs::write(boot.join(layer).join("vmlinuz-5.14"), layer).await?;
    }
    let srv = test_host.paths.root.join("srv");
    tokio::fs::create_dir_all(&srv).await?;
    tokio::fs::write(srv.join("index.html"), "hello").await?;

    let host = &test_host.host;
    let lvs = host.lv_names("hostvg");
    let files = files_below(test_host.dir.path())?;
    assert!(files.iter().any(|(path, _)| path.ends_with("loader/loader.conf")));
    assert!(files.iter().any(|(path, _)| path.ends_with("Image-3.0-0+1/vmlinuz-5.14")));
    host.clear_calls();

    let dry = test_host.imgbase_with(true).await?;
    let commands: [(&str, Box<dyn HostCommand>); 7] = [
        (
            "rollback",
            Box::new(RollbackCommand {
                rollback_options: RollbackOptions::default(),
            }),
        ),
        (
            "base --add",
            Box::new(BaseCommand {
                base_options: BaseOptions {
                    add: Some("Image-4.0-0".into()),
                    size: Some("4096".into()),
                    ..Default::default()
                },
            }),
        ),
        (
            "base --remove",
            Box::new(BaseCommand {
                base_options: BaseOptions {
                    remove: Some("Image-3.0-0".into()),
                    ..Default::default()
                },
            }),
        ),
        (
            "layer --add",
            Box::new(LayerCommand {
                layer_options: LayerOptions {
                    add: Some(Some("Image-1.0-0".into())),
                    ..Default::default()
                },
            }),
        ),
        (
            "volume --create",
            Box::new(VolumeCommand {
                volume_options: VolumeOptions {
                    create: Some(vec![srv.display().to_string(), "1G".into()]),
                    ..Default::default()
                },
            }),
        ),
        (
            "recover",
            Box::new(RecoverCommand {
                recover_options: RecoverOptions {
                    force: true,
                    yes: true,
                    ..Default::default()
                },
            }),
        ),
        (
            "boot --set-default",
            Box::new(BootCommand {
                boot_options: BootOptions {
                    set_default: Some("Image-1.0-0".into()),
                    ..Default::default()
                },
            }),
        ),
    ];

    for (name, command) in &commands {
        let mut out = String::new();
        command
            .execute(&dry, &mut out)
            .await
            .with_context(|| format!("{name} failed in dry-run"))?;
        assert_eq!(host.lv_names("hostvg"), lvs, "{name} changed the volumes");
        assert_eq!(
            files_below(test_host.dir.path())?,
            files,
            "{name} changed the boot configuration or the files"
        );
    }

    for mutating in ["lvcreate", "lvremove", "lvchange", "mkfs.xfs", "mkfs.ext4", "rsync", "systemctl"] {
        assert!(
            host.calls_of(mutating).is_empty(),
            "{mutating} ran in dry-run: {:?}",
            host.calls_of(mutating)
        );
    }
    let default = bootloader.get_default().await?.context("no default")?;
    assert_eq!(default.layer.as_deref(), Some("Image-2.0-0+1"));
    Ok(())
}

//! Kernels of a new layer under `/boot/<layer>/` and the command line booting it.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::{
    fs::{
        copy_file, mkfs,
        mount::{findmnt_source, is_mountpoint},
        sync::quote,
    },
    lvm::LogicalVolume,
    naming::{rpmvercmp, Layer},
    rpmdb::RpmDb,
    runner::{Invocation, Runner},
};

/// Kernel and initramfs of an image, as absolute paths inside the image tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelFiles {
    pub version: String,
    pub vmlinuz: String,
    pub initramfs: Option<String>,
}

impl KernelFiles {
    pub fn initramfs_path(&self) -> String {
        format!("/boot/initramfs-{}.img", self.version)
    }
}

/// Pick the newest kernel out of file lists of the packages providing `kernel`.
pub fn select_kernel<'a>(files: impl IntoIterator<Item = &'a str>) -> Option<KernelFiles> {
    let files = files.into_iter().collect::<Vec<_>>();
    let mut kernels = files
        .iter()
        .filter_map(|f| f.strip_prefix("/boot/vmlinuz-"))
        .filter(|version| !version.contains('/') && !version.starts_with("0-rescue"))
        .collect::<Vec<_>>();
    kernels.sort_by(|a, b| rpmvercmp(a, b));

    let version = kernels.pop()?;
    let initramfs = format!("/boot/initramfs-{version}.img");
    Some(KernelFiles {
        version: version.to_owned(),
        vmlinuz: format!("/boot/vmlinuz-{version}"),
        initramfs: files.contains(&initramfs.as_str()).then_some(initramfs),
    })
}

/// Find the kernel installed in the tree at `root`.
pub async fn find_kernel(runner: &Runner, root: &Path) -> Result<Option<KernelFiles>> {
    let rpmdb = RpmDb::at(runner, root);
    let mut files = vec![];
    for package in rpmdb.providers_of("kernel").await? {
        files.extend(rpmdb.files_of(&package).await?);
    }
    let Some(mut kernel) = select_kernel(files.iter().map(String::as_str)) else {
        return Ok(None);
    };

    // the initramfs is generated on install and may be missing from the file list
    if kernel.initramfs.is_none() {
        let generated = kernel.initramfs_path();
        if in_tree(root, &generated).exists() {
            kernel.initramfs = Some(generated);
        }
    }
    Ok(Some(kernel))
}

fn in_tree(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

/// API filesystems dracut needs inside the tree.
const API_FILESYSTEMS: [&str; 4] = ["/proc", "/sys", "/dev", "/run"];

/// Rebuild the initramfs of `kernel` inside the tree at `root`.
///
/// dracut runs in a private mount namespace. The API filesystems bound into the tree only exist
/// in that namespace and go away with it, also when dracut fails.
pub async fn regenerate_initramfs(
    runner: &Runner,
    root: &Path,
    kernel: &mut KernelFiles,
) -> Result<()> {
    tracing::info!("Regenerating the initramfs of {} in the new layer", kernel.version);
    let initramfs = kernel.initramfs_path();
    runner
        .run(
            Invocation::new("unshare")
                .args(["--mount", "--propagation", "private", "--", "sh", "-c"])
                .arg(initramfs_script(root, &initramfs, &kernel.version)?),
        )
        .await
        .context("Failed to regenerate the initramfs")?;
    kernel.initramfs = Some(initramfs);
    Ok(())
}

fn initramfs_script(root: &Path, initramfs: &str, version: &str) -> Result<String> {
    let mut script = String::from("set -e\n");
    for dir in API_FILESYSTEMS {
        script.push_str(&format!(
            "mount --rbind {dir} {}\n",
            quote(&in_tree(root, dir))?
        ));
    }
    script.push_str(&format!(
        "exec chroot {} dracut -f --add multipath {} {}\n",
        quote(root)?,
        quote(Path::new(initramfs))?,
        quote(Path::new(version))?,
    ));
    Ok(script)
}

/// Boot files of a layer, relative to `/boot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedKernel {
    pub version: String,
    pub vmlinuz: String,
    pub initramfs: Option<String>,
}

/// Copy the kernel of the tree at `root` to `<boot>/<layer>/`, and the vmlinuz to `<boot>/` too
/// for loaders looking there.
pub async fn place_kernel(
    runner: &Runner,
    root: &Path,
    boot: &Path,
    layer: &Layer,
    kernel: &KernelFiles,
) -> Result<PlacedKernel> {
    let layer_dir = layer.to_string();
    let file_name = |path: &str| {
        Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{path:?} has no file name"))
    };

    let vmlinuz = file_name(&kernel.vmlinuz)?;
    copy_file(runner, in_tree(root, &kernel.vmlinuz), boot.join(&layer_dir).join(&vmlinuz)).await?;
    copy_file(runner, in_tree(root, &kernel.vmlinuz), boot.join(&vmlinuz)).await?;

    let initramfs = match &kernel.initramfs {
        Some(initramfs) => {
            let name = file_name(initramfs)?;
            copy_file(runner, in_tree(root, initramfs), boot.join(&layer_dir).join(&name)).await?;
            Some(format!("/{layer_dir}/{name}"))
        }
        None => {
            tracing::info!("No initramfs for kernel {}", kernel.version);
            None
        }
    };

    Ok(PlacedKernel {
        version: kernel.version.clone(),
        vmlinuz: format!("/{layer_dir}/{vmlinuz}"),
        initramfs,
    })
}

/// Arguments a layer cannot boot without.
pub fn mandatory_args(lv: &LogicalVolume, boot_uuid: Option<&str>) -> Vec<String> {
    let mut args = vec![
        format!("rd.lvm.lv={}", lv.lvm_name()),
        format!("root={}", lv.path().display()),
        "rootflags=discard".to_owned(),
    ];
    if let Some(uuid) = boot_uuid {
        args.push(format!("boot=UUID={uuid}"));
    }
    args
}

/// Arguments of `previous` followed by the mandatory ones, without duplicates. Root and boot
/// selection of `previous` is replaced.
pub fn compose_cmdline(previous: Option<&str>, lv: &LogicalVolume, boot_uuid: Option<&str>) -> String {
    const REPLACED: &[&str] = &["root=", "rootflags=", "boot=", "img.bootid="];

    let mut args: Vec<String> = vec![];
    let carried = previous
        .unwrap_or_default()
        .split_whitespace()
        .filter(|arg| !REPLACED.iter().any(|p| arg.starts_with(p)))
        .map(ToOwned::to_owned);
    for arg in carried.chain(mandatory_args(lv, boot_uuid)) {
        if !args.contains(&arg) {
            args.push(arg);
        }
    }
    args.join(" ")
}

/// UUID of the filesystem on `/boot` when it is a separate mount.
pub async fn boot_uuid(runner: &Runner, boot: &Path) -> Result<Option<String>> {
    if !is_mountpoint(runner, boot).await? {
        return Ok(None);
    }
    let source = findmnt_source(runner, boot).await?;
    Ok(Some(mkfs::uuid(runner, source).await?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Context as _;

    use super::*;
    use crate::testutils::FakeHost;

    #[test]
    fn test_select_kernel() {
        let files = [
            "/boot/vmlinuz-5.14.0-9.el9.x86_64",
            "/boot/vmlinuz-5.14.0-10.el9.x86_64",
            "/boot/initramfs-5.14.0-10.el9.x86_64.img",
            "/boot/vmlinuz-0-rescue-abc",
            "/lib/modules/5.14.0-10.el9.x86_64/vmlinuz",
        ];
        let kernel = select_kernel(files).unwrap();
        assert_eq!(kernel.version, "5.14.0-10.el9.x86_64");
        assert_eq!(kernel.vmlinuz, "/boot/vmlinuz-5.14.0-10.el9.x86_64");
        assert_eq!(
            kernel.initramfs.as_deref(),
            Some("/boot/initramfs-5.14.0-10.el9.x86_64.img")
        );
        assert_eq!(select_kernel(["/usr/bin/true"]), None);
    }

    #[test]
    fn test_compose_cmdline() {
        let lv = LogicalVolume::new("hostvg", "Image-2.0-0+1");
        let cmdline = compose_cmdline(
            Some("crashkernel=auto rd.lvm.lv=hostvg/Image-2.0-0+1 rd.lvm.lv=hostvg/swap root=/dev/hostvg/Image-1.0-0+1 quiet img.bootid=deadbeef"),
            &lv,
            Some("1234-abcd"),
        );
        assert_eq!(
            cmdline,
            "crashkernel=auto rd.lvm.lv=hostvg/Image-2.0-0+1 rd.lvm.lv=hostvg/swap quiet \
             root=/dev/hostvg/Image-2.0-0+1 rootflags=discard boot=UUID=1234-abcd"
        );

        assert_eq!(
            compose_cmdline(None, &lv, None),
            "rd.lvm.lv=hostvg/Image-2.0-0+1 root=/dev/hostvg/Image-2.0-0+1 rootflags=discard"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_place_kernel() -> Result<()> {
        let root = tempfile::tempdir()?;
        let boot = tempfile::tempdir()?;
        tokio::fs::create_dir_all(root.path().join("boot")).await?;
        tokio::fs::write(root.path().join("boot/vmlinuz-5.14"), "kernel").await?;
        tokio::fs::write(root.path().join("boot/initramfs-5.14.img"), "initrd").await?;

        let host = Arc::new(FakeHost::new());
        host.add_package(
            "kernel-core-5.14-1.x86_64",
            &["kernel"],
            &["/boot/vmlinuz-5.14", "/lib/modules/5.14/vmlinuz"],
        );
        let runner = Runner::with_executor(host, false);

        let kernel = find_kernel(&runner, root.path())
            .await?
            .context("kernel not found")?;
        assert_eq!(kernel.initramfs.as_deref(), Some("/boot/initramfs-5.14.img"));

        let layer: Layer = "Image-2.0-0+1".parse()?;
        let placed = place_kernel(&runner, root.path(), boot.path(), &layer, &kernel).await?;
        assert_eq!(placed.vmlinuz, "/Image-2.0-0+1/vmlinuz-5.14");
        assert_eq!(placed.initramfs.as_deref(), Some("/Image-2.0-0+1/initramfs-5.14.img"));
        assert!(boot.path().join("Image-2.0-0+1/vmlinuz-5.14").exists());
        assert!(boot.path().join("Image-2.0-0+1/initramfs-5.14.img").exists());
        assert!(boot.path().join("vmlinuz-5.14").exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_regenerate_initramfs_in_private_namespace() -> Result<()> {
        let host = Arc::new(FakeHost::new());
        let runner = Runner::with_executor(host.clone(), false);
        let mut kernel = KernelFiles {
            version: "5.14".into(),
            vmlinuz: "/boot/vmlinuz-5.14".into(),
            initramfs: None,
        };

        regenerate_initramfs(&runner, Path::new("/run/new root"), &mut kernel).await?;
        assert_eq!(kernel.initramfs.as_deref(), Some("/boot/initramfs-5.14.img"));

        let calls = host.calls();
        assert_eq!(calls.len(), 1);
        let argv = &calls[0];
        assert_eq!(argv[..6], ["unshare", "--mount", "--propagation", "private", "--", "sh"]);
        let script = &argv[7];
        assert!(script.starts_with("set -e\nmount --rbind /proc '/run/new root/proc'\n"));
        assert!(script.contains("mount --rbind /run '/run/new root/run'\n"));
        assert!(script.ends_with(
            "exec chroot '/run/new root' dracut -f --add multipath /boot/initramfs-5.14.img 5.14\n"
        ));
        assert!(host.mounts().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_boot_uuid_only_for_separate_mount() -> Result<()> {
        let host = Arc::new(FakeHost::new());
        let runner = Runner::with_executor(host.clone(), false);
        assert_eq!(boot_uuid(&runner, Path::new("/boot")).await?, None);

        host.set_static_mount("/boot", "/dev/sda1", "rw");
        assert_eq!(
            boot_uuid(&runner, Path::new("/boot")).await?.as_deref(),
            Some("uuid-sda1")
        );
        Ok(())
    }
}

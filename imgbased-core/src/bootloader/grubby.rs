use std::path::PathBuf;

use anyhow::{Context as _, Result};

use super::BootEntry;
use crate::runner::{safe_write::SafeWrite, Invocation, Runner};

/// Drives the `grubby` tool. Mutations are guarded by a copy of the grub config.
pub struct Grubby {
    runner: Runner,
    boot_dir: PathBuf,
    config: PathBuf,
}

impl Grubby {
    pub fn new(runner: &Runner, boot_dir: impl Into<PathBuf>, config: impl Into<PathBuf>) -> Self {
        Self {
            runner: runner.clone(),
            boot_dir: boot_dir.into(),
            config: config.into(),
        }
    }

    async fn mutate(&self, invocation: Invocation) -> Result<()> {
        SafeWrite::guarded(&self.config, async {
            self.runner.run(invocation).await?;
            Ok(())
        })
        .await
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        self.boot_dir.join(relative.trim_start_matches('/'))
    }

    pub async fn entries(&self) -> Result<Vec<BootEntry>> {
        let info = self
            .runner
            .run(Invocation::new("grubby").arg("--info=ALL").read_only())
            .await?;
        Ok(parse_info(&info))
    }

    pub async fn add_entry(&self, entry: &BootEntry) -> Result<()> {
        let mut invocation = Invocation::new("grubby")
            .arg(format!(
                "--add-kernel={}",
                self.absolute(&entry.kernel).display()
            ))
            .arg(format!("--args={}", entry.cmdline))
            .arg(format!("--title={}", entry.title));
        if let Some(initrd) = &entry.initrd {
            invocation = invocation.arg(format!("--initrd={}", self.absolute(initrd).display()));
        }
        self.mutate(invocation).await
    }

    pub async fn remove_entry(&self, entry: &BootEntry) -> Result<()> {
        self.mutate(Invocation::new("grubby").arg(format!("--remove-kernel={}", entry.id)))
            .await
    }

    pub async fn set_default_entry(&self, entry: &BootEntry) -> Result<()> {
        self.mutate(Invocation::new("grubby").arg(format!("--set-default-index={}", entry.id)))
            .await
    }

    pub async fn default_id(&self) -> Result<Option<String>> {
        let index = self
            .runner
            .run(Invocation::new("grubby").arg("--default-index").read_only())
            .await
            .context("Failed to query default index")?;
        Ok(index
            .trim()
            .parse::<usize>()
            .ok()
            .map(|index| index.to_string()))
    }
}

/// Parse `grubby --info=ALL`. Every block starts with `index=`; entries without a kernel or with
/// a negative index are skipped.
pub fn parse_info(info: &str) -> Vec<BootEntry> {
    #[derive(Default)]
    struct Block {
        index: Option<usize>,
        kernel: Option<String>,
        initrd: Option<String>,
        args: String,
        root: Option<String>,
        title: String,
    }

    fn finish(block: Block) -> Option<BootEntry> {
        let kernel = block.kernel?;
        let mut cmdline = block.args;
        if let Some(root) = block.root.filter(|_| !cmdline.contains("root=")) {
            cmdline = format!("root={root} {cmdline}").trim().to_owned();
        }
        let relative = |p: String| match p.strip_prefix("/boot/") {
            Some(rest) => format!("/{rest}"),
            None => p,
        };
        Some(
            BootEntry {
                id: block.index?.to_string(),
                bootid: None,
                title: block.title,
                kernel: relative(kernel),
                initrd: block.initrd.map(relative),
                cmdline,
                layer: None,
            }
            .derive_references(),
        )
    }

    let mut entries = vec![];
    let mut block: Option<Block> = None;
    for line in info.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_owned();
        if key == "index" {
            if let Some(entry) = block.take().and_then(finish) {
                entries.push(entry);
            }
            block = Some(Block {
                index: value.parse().ok(),
                ..Default::default()
            });
            continue;
        }
        let Some(block) = block.as_mut() else {
            continue;
        };
        match key {
            "kernel" => block.kernel = Some(value),
            "initrd" => block.initrd = Some(value),
            "args" => block.args = value,
            "root" => block.root = Some(value),
            "title" => block.title = value,
            _ => {}
        }
    }
    if let Some(entry) = block.and_then(finish) {
        entries.push(entry);
    }
    entries
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testutils::FakeHost;

    const INFO: &str = r#"index=0
kernel="/boot/Image-2.0-0+1/vmlinuz-5.14.0-2.el9.x86_64"
args="ro crashkernel=auto rd.lvm.lv=hostvg/Image-2.0-0+1 img.bootid=0badf00d"
root="/dev/hostvg/Image-2.0-0+1"
initrd="/boot/Image-2.0-0+1/initramfs-5.14.0-2.el9.x86_64.img"
title="Image-2.0-0 (5.14.0-2.el9.x86_64)"
id="a1b2-5.14.0-2"
index=1
kernel="/boot/vmlinuz-0-rescue"
args="ro"
root="/dev/hostvg/root"
title="Rescue"
index=2
non linux entry
index=-1
"#;

    #[test]
    fn test_parse_info() {
        let entries = parse_info(INFO);
        assert_eq!(entries.len(), 2);

        let first = &entries[0];
        assert_eq!(first.id, "0");
        assert_eq!(first.bootid.as_deref(), Some("0badf00d"));
        assert_eq!(first.layer.as_deref(), Some("Image-2.0-0+1"));
        assert_eq!(first.kernel, "/Image-2.0-0+1/vmlinuz-5.14.0-2.el9.x86_64");
        assert!(first.cmdline.starts_with("root=/dev/hostvg/Image-2.0-0+1 ro"));

        let rescue = &entries[1];
        assert_eq!(rescue.id, "1");
        assert_eq!(rescue.bootid, None);
        assert_eq!(rescue.layer, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_add_entry_args() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = dir.path().join("grub.cfg");
        tokio::fs::write(&config, "menuentry {}\n").await?;

        let host = Arc::new(FakeHost::new());
        let grubby = Grubby::new(&Runner::with_executor(host.clone(), false), "/boot", &config);
        grubby
            .add_entry(&BootEntry {
                id: String::new(),
                bootid: Some("12345678".into()),
                title: "Image-2.0-0 (5.14)".into(),
                kernel: "/Image-2.0-0+1/vmlinuz-5.14".into(),
                initrd: Some("/Image-2.0-0+1/initramfs-5.14.img".into()),
                cmdline: "ro img.bootid=12345678".into(),
                layer: None,
            })
            .await?;

        assert_eq!(
            host.calls_of("grubby"),
            vec![vec![
                "grubby".to_owned(),
                "--add-kernel=/boot/Image-2.0-0+1/vmlinuz-5.14".to_owned(),
                "--args=ro img.bootid=12345678".to_owned(),
                "--title=Image-2.0-0 (5.14)".to_owned(),
                "--initrd=/boot/Image-2.0-0+1/initramfs-5.14.img".to_owned(),
            ]]
        );
        Ok(())
    }
}

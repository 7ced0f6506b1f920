//! Health checks of the layout. Nothing here changes the host.

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::Instrument as _;

use crate::{
    error::Error,
    fs::mount::findmnt_options,
    imgbase::Imgbase,
    lvm::{TAG_POOL, TAG_VG},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

pub const CHECKS: &[&str] = &[
    "vg-tagged",
    "pool-tagged",
    "layout-valid",
    "current-layer",
    "pool-data-usage",
    "pool-metadata-usage",
    "pool-metadata-size",
    "root-discard",
    "boot-entry",
];

/// Run every check, in [`CHECKS`] order. A failing check does not stop the others.
pub async fn run_checks(imgbase: &Imgbase) -> Vec<CheckResult> {
    let mut results = vec![];
    for &name in CHECKS {
        let outcome = run_check(imgbase, name)
            .instrument(tracing::info_span!("check", name))
            .await;
        let result = match outcome {
            Ok(detail) => {
                tracing::debug!("Check {name} passed: {detail}");
                CheckResult {
                    name,
                    passed: true,
                    detail,
                }
            }
            Err(error) => {
                tracing::error!("Check {name} failed: {error:#}");
                CheckResult {
                    name,
                    passed: false,
                    detail: format!("{error:#}"),
                }
            }
        };
        results.push(result);
    }
    results
}

async fn run_check(imgbase: &Imgbase, name: &str) -> Result<String> {
    let layout = imgbase.layout();
    let lvm = imgbase.lvm();
    let config = imgbase.config();

    match name {
        "vg-tagged" => match lvm.list_vgs(Some(TAG_VG)).await?.as_slice() {
            [vg] => Ok(format!("volume group {vg}")),
            [] => bail!("no volume group is tagged {TAG_VG}"),
            vgs => bail!("{} volume groups are tagged {TAG_VG}", vgs.len()),
        },
        "pool-tagged" => match lvm.list_lvs(Some(TAG_POOL)).await?.as_slice() {
            [pool] => Ok(format!("thin pool {pool}")),
            [] => bail!("no thin pool is tagged {TAG_POOL}"),
            pools => bail!("{} thin pools are tagged {TAG_POOL}", pools.len()),
        },
        "layout-valid" => {
            let tree = layout.tree().await?;
            if tree.bases().is_empty() {
                bail!(Error::NoBases);
            }
            Ok(format!(
                "{} bases, {} layers",
                tree.bases().len(),
                tree.layers().len()
            ))
        }
        "current-layer" => {
            let current = layout.current_layer().await?;
            if !layout.tree().await?.contains_layer(&current) {
                bail!(Error::NoValidLayout(format!("{current} is not in the layout")));
            }
            Ok(current.to_string())
        }
        "pool-data-usage" | "pool-metadata-usage" => {
            let pool = layout.pool().await?;
            let (data, metadata) = lvm.pool_usage(&pool).await?;
            let usage = if name == "pool-data-usage" { data } else { metadata };
            let threshold = config.pool_usage_threshold();
            if usage >= threshold {
                bail!("{pool} is {usage:.1}% used, the threshold is {threshold:.0}%");
            }
            Ok(format!("{usage:.1}% used"))
        }
        "pool-metadata-size" => {
            let pool = layout.pool().await?;
            let size = lvm.metadata_size_bytes(&pool).await?;
            let minimum = config.min_metadata_size_bytes();
            if size < minimum {
                bail!(Error::ThinPoolMetadataTooSmall {
                    pool: pool.to_string(),
                    size,
                    minimum,
                });
            }
            Ok(format!("{size} bytes"))
        }
        "root-discard" => {
            let root = &imgbase.paths().root;
            let options = findmnt_options(imgbase.runner(), root).await?;
            if !options.iter().any(|o| o == "discard") {
                bail!("{root:?} is mounted without discard");
            }
            Ok(options.join(","))
        }
        "boot-entry" => {
            let current = layout.current_layer().await?;
            match imgbase.bootloader().entry_of(&current).await? {
                Some(entry) => Ok(entry.title),
                None => bail!(Error::BootEntryMissing(current.to_string())),
            }
        }
        other => bail!("unknown check {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::InMemoryConfigSource, imgbase::HostPaths, runner::Runner, testutils::FakeHost,
    };

    fn failed(results: &[CheckResult]) -> Vec<&'static str> {
        results.iter().filter(|r| !r.passed).map(|r| r.name).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_checks_without_layout() -> Result<()> {
        let host = Arc::new(FakeHost::with_thin_root("hostvg", "pool0", "root", 10 << 30));
        let dir = tempfile::tempdir()?;
        let paths = HostPaths::under(dir.path());
        host.set_static_mount(&paths.root.to_string_lossy(), "/dev/hostvg/root", "rw");
        let imgbase = Imgbase::load(
            Runner::with_executor(host.clone(), false),
            &InMemoryConfigSource::new(""),
            paths,
        )
        .await?;

        let results = run_checks(&imgbase).await;
        assert_eq!(results.len(), CHECKS.len());
        assert_eq!(failed(&results), CHECKS);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_checks_on_layout() -> Result<()> {
        let host = Arc::new(FakeHost::with_thin_root("hostvg", "pool0", "root", 10 << 30));
        let dir = tempfile::tempdir()?;
        let paths = HostPaths::under(dir.path());
        let root = paths.root.to_string_lossy().into_owned();
        host.set_static_mount(&root, "/dev/hostvg/root", "rw");
        let config = format!(
            "[bootloader]\nkind = bls\nentries = {}\n",
            dir.path().join("loader/entries").display()
        );
        let imgbase = Imgbase::load(
            Runner::with_executor(host.clone(), false),
            &InMemoryConfigSource::new(config),
            paths,
        )
        .await?;
        let layer = imgbase
            .layout()
            .init_from("hostvg/root", &"Image-1.0-0".parse()?)
            .await?;
        host.set_static_mount(&root, "/dev/hostvg/Image-1.0-0+1", "rw,relatime,discard");
        host.set_pool_usage("hostvg", "pool0", 85.0, 10.0, 512 << 20);
        let calls = host.calls().len();

        let results = run_checks(&imgbase).await;
        assert_eq!(
            failed(&results),
            ["pool-data-usage", "pool-metadata-size", "boot-entry"]
        );
        let too_small = results
            .iter()
            .find(|r| r.name == "pool-metadata-size")
            .map(|r| r.detail.clone())
            .unwrap_or_default();
        assert!(too_small.contains("too small"), "{too_small}");

        imgbase
            .bootloader()
            .add(&layer, "Image-1.0-0", "/Image-1.0-0+1/vmlinuz-5.14", None, "ro")
            .await?;
        host.set_pool_usage("hostvg", "pool0", 12.0, 4.0, 1 << 30);
        assert!(failed(&run_checks(&imgbase).await).is_empty());

        // only queries were issued
        let mutating = ["lvchange", "lvcreate", "lvremove", "lvrename", "vgchange", "mount"];
        assert!(host.calls()[calls..]
            .iter()
            .all(|argv| !mutating.contains(&argv[0].as_str())));
        Ok(())
    }
}

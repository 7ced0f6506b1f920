use std::{
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use again::RetryPolicy;
use anyhow::{anyhow, bail, Context as _, Result};
use serde::Serialize;

use crate::{
    async_defer,
    error::Error,
    runner::{Invocation, Runner},
};

pub const TAG_VG: &str = "imgbased:vg";
pub const TAG_POOL: &str = "imgbased:pool";
pub const TAG_VOLUME: &str = "imgbased:volume";
pub const TAG_BASE: &str = "imgbased:base";
pub const TAG_LAYER: &str = "imgbased:layer";

const MAX_NAME_LEN: usize = 55;
const FIELD_SEPARATOR: &str = "|";

/// Check a volume name against the characters and length LVM accepts.
pub fn validate_name(name: &str) -> Result<()> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-');
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('-')
        && name.chars().all(valid_char);
    if !valid {
        bail!(Error::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Parse a number printed by LVM, which may use `,` as decimal separator depending on the
/// locale the tool was built with.
pub fn parse_number(value: &str) -> Result<f64> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0.0);
    }
    value
        .replace(',', ".")
        .parse::<f64>()
        .with_context(|| format!("Failed to parse number from LVM output: {value:?}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LogicalVolume {
    pub vg: String,
    pub name: String,
}

impl LogicalVolume {
    pub fn new(vg: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            vg: vg.into(),
            name: name.into(),
        }
    }

    /// `vg/lv` form used on LVM command lines.
    pub fn lvm_name(&self) -> String {
        format!("{}/{}", self.vg, self.name)
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from("/dev").join(&self.vg).join(&self.name)
    }

    /// The same volume group, another volume.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.vg.clone(), name)
    }
}

impl Display for LogicalVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.vg, self.name)
    }
}

impl FromStr for LogicalVolume {
    type Err = anyhow::Error;

    /// Accepts `vg/lv` and `/dev/vg/lv`.
    fn from_str(s: &str) -> Result<Self> {
        let spec = s.strip_prefix("/dev/").unwrap_or(s);
        let (vg, name) = spec
            .split_once('/')
            .ok_or_else(|| anyhow!("Expected a volume in the form vg/lv, got {s:?}"))?;
        if vg.is_empty() || name.contains('/') {
            bail!("Expected a volume in the form vg/lv, got {s:?}");
        }
        validate_name(name)?;
        Ok(Self::new(vg, name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VolumeGroup {
    pub name: String,
}

impl Display for VolumeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

impl Permission {
    fn as_arg(&self) -> &'static str {
        match self {
            Permission::ReadOnly => "r",
            Permission::ReadWrite => "rw",
        }
    }
}

/// Decoded `lv_attr` column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LvAttributes {
    pub thin: bool,
    pub pool: bool,
    pub writable: bool,
    pub active: bool,
    pub activation_skip: bool,
}

impl FromStr for LvAttributes {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let attr = s.trim().as_bytes();
        if attr.len() < 5 {
            bail!("Unexpected lv_attr value {s:?}");
        }
        Ok(Self {
            thin: attr[0] == b'V',
            pool: attr[0] == b't',
            writable: attr[1] == b'w',
            active: attr[4] == b'a',
            activation_skip: attr.get(9) == Some(&b'k'),
        })
    }
}

/// Thin LVM operations. All state is read back from LVM on every call.
#[derive(Clone)]
pub struct Lvm {
    runner: Runner,
}

impl Lvm {
    pub fn new(runner: Runner) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub async fn list_lvs(&self, tag: Option<&str>) -> Result<Vec<LogicalVolume>> {
        let mut invocation = Invocation::new("lvs")
            .args(["--noheadings", "--separator", FIELD_SEPARATOR])
            .args(["-o", "vg_name,lv_name"])
            .read_only();
        if let Some(tag) = tag {
            invocation = invocation.arg(format!("@{tag}"));
        }

        let output = self
            .runner
            .run(invocation)
            .await
            .context("Failed to list logical volumes")?;

        Ok(output
            .lines()
            .filter_map(|line| {
                let (vg, lv) = line.trim().split_once(FIELD_SEPARATOR)?;
                Some(LogicalVolume::new(vg.trim(), lv.trim()))
            })
            .collect())
    }

    pub async fn list_vgs(&self, tag: Option<&str>) -> Result<Vec<VolumeGroup>> {
        let mut invocation = Invocation::new("vgs")
            .args(["--noheadings", "--separator", FIELD_SEPARATOR])
            .args(["-o", "vg_name"])
            .read_only();
        if let Some(tag) = tag {
            invocation = invocation.arg(format!("@{tag}"));
        }

        let output = self
            .runner
            .run(invocation)
            .await
            .context("Failed to list volume groups")?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|name| VolumeGroup {
                name: name.to_owned(),
            })
            .collect())
    }

    pub async fn vg_by_tag(&self, tag: &str) -> Result<VolumeGroup> {
        let mut vgs = self.list_vgs(Some(tag)).await?;
        match vgs.len() {
            1 => Ok(vgs.remove(0)),
            0 => bail!(Error::NoValidLayout(format!(
                "no volume group carries the tag {tag}"
            ))),
            n => bail!(Error::NoValidLayout(format!(
                "{n} volume groups carry the tag {tag}, expected exactly one"
            ))),
        }
    }

    pub async fn lv_by_tag(&self, tag: &str) -> Result<LogicalVolume> {
        let mut lvs = self.list_lvs(Some(tag)).await?;
        match lvs.len() {
            1 => Ok(lvs.remove(0)),
            0 => bail!(Error::NoValidLayout(format!(
                "no logical volume carries the tag {tag}"
            ))),
            n => bail!(Error::NoValidLayout(format!(
                "{n} logical volumes carry the tag {tag}, expected exactly one"
            ))),
        }
    }

    /// Resolve a device node such as `/dev/vg/lv` or `/dev/mapper/vg-lv`.
    pub async fn from_path(&self, path: impl AsRef<Path>) -> Result<LogicalVolume> {
        let path = path.as_ref();
        let output = self
            .runner
            .run(
                Invocation::new("lvs")
                    .args(["--noheadings", "--separator", FIELD_SEPARATOR])
                    .args(["-o", "vg_name,lv_name"])
                    .arg(path)
                    .read_only(),
            )
            .await
            .with_context(|| format!("Failed to resolve logical volume of {path:?}"))?;

        let (vg, lv) = output
            .trim()
            .split_once(FIELD_SEPARATOR)
            .ok_or_else(|| anyhow!("{path:?} is not a logical volume"))?;
        Ok(LogicalVolume::new(vg.trim(), lv.trim()))
    }

    /// Resolve `vg/lv` and make sure it exists.
    pub async fn from_lvm_name(&self, spec: &str) -> Result<LogicalVolume> {
        let lv = spec.parse::<LogicalVolume>()?;
        if !self.exists(&lv).await? {
            bail!("Logical volume {lv} does not exist");
        }
        Ok(lv)
    }

    /// Resolve a volume from a device path, a mount point, a `vg/lv` spec or a `@tag`.
    pub async fn try_find(&self, mixed: &str) -> Result<LogicalVolume> {
        if let Some(tag) = mixed.strip_prefix('@') {
            self.lv_by_tag(tag).await
        } else if mixed.starts_with("/dev/") {
            self.from_path(mixed).await
        } else if mixed.starts_with('/') {
            let source = crate::fs::mount::findmnt_source(&self.runner, mixed).await?;
            self.from_path(source).await
        } else {
            self.from_lvm_name(mixed).await
        }
    }

    pub async fn exists(&self, lv: &LogicalVolume) -> Result<bool> {
        Ok(self.list_lvs(None).await?.contains(lv))
    }

    async fn field(&self, target: &str, field: &str) -> Result<String> {
        let output = self
            .runner
            .run(
                Invocation::new("lvs")
                    .args(["--noheadings", "--nosuffix", "--units", "b"])
                    .args(["--separator", FIELD_SEPARATOR, "-o", field, target])
                    .read_only(),
            )
            .await
            .with_context(|| format!("Failed to query {field} of {target}"))?;
        Ok(output.trim().to_owned())
    }

    pub async fn size_bytes(&self, lv: &LogicalVolume) -> Result<u64> {
        let size = self.field(&lv.lvm_name(), "lv_size").await?;
        Ok(parse_number(&size)? as u64)
    }

    /// The immediate snapshot parent.
    pub async fn origin(&self, lv: &LogicalVolume) -> Result<Option<LogicalVolume>> {
        let origin = self.field(&lv.lvm_name(), "origin").await?;
        Ok((!origin.is_empty()).then(|| lv.sibling(origin)))
    }

    pub async fn thinpool(&self, lv: &LogicalVolume) -> Result<LogicalVolume> {
        let pool = self.field(&lv.lvm_name(), "pool_lv").await?;
        if pool.is_empty() {
            bail!(Error::MissingThinPool(lv.lvm_name()));
        }
        Ok(lv.sibling(pool))
    }

    pub async fn tags(&self, lv: &LogicalVolume) -> Result<Vec<String>> {
        let tags = self.field(&lv.lvm_name(), "lv_tags").await?;
        Ok(tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    pub async fn attributes(&self, lv: &LogicalVolume) -> Result<LvAttributes> {
        self.field(&lv.lvm_name(), "lv_attr").await?.parse()
    }

    /// Data and metadata usage of a thin pool, in percent.
    pub async fn pool_usage(&self, pool: &LogicalVolume) -> Result<(f64, f64)> {
        let data = parse_number(&self.field(&pool.lvm_name(), "data_percent").await?)?;
        let metadata = parse_number(&self.field(&pool.lvm_name(), "metadata_percent").await?)?;
        Ok((data, metadata))
    }

    pub async fn metadata_size_bytes(&self, pool: &LogicalVolume) -> Result<u64> {
        let size = self.field(&pool.lvm_name(), "lv_metadata_size").await?;
        Ok(parse_number(&size)? as u64)
    }

    pub async fn vg_free_bytes(&self, vg: &VolumeGroup) -> Result<u64> {
        let output = self
            .runner
            .run(
                Invocation::new("vgs")
                    .args(["--noheadings", "--nosuffix", "--units", "b"])
                    .args(["--separator", FIELD_SEPARATOR, "-o", "vg_free", &vg.name])
                    .read_only(),
            )
            .await
            .with_context(|| format!("Failed to query free space of {vg}"))?;
        Ok(parse_number(&output)? as u64)
    }

    pub async fn add_tag(&self, lv: &LogicalVolume, tag: &str) -> Result<()> {
        self.runner
            .call("lvchange", ["--addtag", tag, &lv.lvm_name()])
            .await
            .with_context(|| format!("Failed to tag {lv} with {tag}"))?;
        Ok(())
    }

    pub async fn vg_add_tag(&self, vg: &VolumeGroup, tag: &str) -> Result<()> {
        self.runner
            .call("vgchange", ["--addtag", tag, &vg.name])
            .await
            .with_context(|| format!("Failed to tag {vg} with {tag}"))?;
        Ok(())
    }

    pub async fn create_thin(
        &self,
        pool: &LogicalVolume,
        name: &str,
        size_bytes: u64,
    ) -> Result<LogicalVolume> {
        validate_name(name)?;
        self.runner
            .call(
                "lvcreate",
                [
                    "--thin",
                    "--virtualsize",
                    &format!("{size_bytes}B"),
                    "--name",
                    name,
                    &pool.lvm_name(),
                ],
            )
            .await
            .with_context(|| format!("Failed to create thin volume {name} in {pool}"))?;
        Ok(pool.sibling(name))
    }

    /// Create a thin snapshot. Activation and activation skip are left to the caller.
    pub async fn snapshot(&self, origin: &LogicalVolume, new_name: &str) -> Result<LogicalVolume> {
        validate_name(new_name)?;
        self.runner
            .call(
                "lvcreate",
                ["--snapshot", "--name", new_name, &origin.lvm_name()],
            )
            .await
            .with_context(|| format!("Failed to snapshot {origin} as {new_name}"))?;
        Ok(origin.sibling(new_name))
    }

    pub async fn rename(&self, lv: &LogicalVolume, new_name: &str) -> Result<LogicalVolume> {
        validate_name(new_name)?;
        self.runner
            .call("lvrename", [lv.vg.as_str(), lv.name.as_str(), new_name])
            .await
            .with_context(|| format!("Failed to rename {lv} to {new_name}"))?;
        Ok(lv.sibling(new_name))
    }

    /// Remove a volume, retrying a few times while udev or a lingering mount keeps it busy.
    pub async fn remove(&self, lv: &LogicalVolume) -> Result<()> {
        let lvm_name = lv.lvm_name();
        let (runner, lvm_name) = (&self.runner, lvm_name.as_str());
        RetryPolicy::fixed(Duration::from_secs(1))
            .with_max_retries(2)
            .retry(|| async move { runner.call("lvremove", ["-ff", lvm_name]).await })
            .await
            .with_context(|| format!("Failed to remove {lv}"))?;
        Ok(())
    }

    pub async fn set_permission(&self, lv: &LogicalVolume, permission: Permission) -> Result<()> {
        self.runner
            .call(
                "lvchange",
                ["--permission", permission.as_arg(), &lv.lvm_name()],
            )
            .await
            .with_context(|| format!("Failed to set permission of {lv}"))?;
        Ok(())
    }

    pub async fn set_activation_skip(&self, lv: &LogicalVolume, skip: bool) -> Result<()> {
        self.runner
            .call(
                "lvchange",
                [
                    "--setactivationskip",
                    if skip { "y" } else { "n" },
                    &lv.lvm_name(),
                ],
            )
            .await
            .with_context(|| format!("Failed to set activation skip of {lv}"))?;
        Ok(())
    }

    pub async fn activate(&self, lv: &LogicalVolume, active: bool) -> Result<()> {
        let mut invocation =
            Invocation::new("lvchange").args(["--activate", if active { "y" } else { "n" }]);
        if active {
            // ignore the activation skip flag
            invocation = invocation.arg("-K");
        }
        self.runner
            .run(invocation.arg(lv.lvm_name()))
            .await
            .with_context(|| {
                format!(
                    "Failed to {} {lv}",
                    if active { "activate" } else { "deactivate" }
                )
            })?;
        Ok(())
    }

    /// Read-only, skipped on activation and inactive.
    pub async fn protect(&self, lv: &LogicalVolume) -> Result<()> {
        tracing::debug!("Protecting {lv}");
        self.set_permission(lv, Permission::ReadOnly).await?;
        self.set_activation_skip(lv, true).await?;
        self.activate(lv, false).await?;
        Ok(())
    }

    /// Writable, activated on boot and active.
    pub async fn unprotect(&self, lv: &LogicalVolume) -> Result<()> {
        tracing::debug!("Unprotecting {lv}");
        self.set_activation_skip(lv, false).await?;
        self.activate(lv, true).await?;
        self.set_permission(lv, Permission::ReadWrite).await?;
        Ok(())
    }

    /// Unprotect `lv` until the returned guard is dropped.
    pub async fn unprotected(&self, lv: &LogicalVolume) -> Result<Unprotected> {
        self.unprotect(lv).await?;
        Ok(Unprotected {
            lvm: self.clone(),
            lv: lv.clone(),
        })
    }
}

/// Re-protects its volume when dropped, on every exit path.
pub struct Unprotected {
    lvm: Lvm,
    lv: LogicalVolume,
}

impl Unprotected {
    pub fn lv(&self) -> &LogicalVolume {
        &self.lv
    }
}

impl Drop for Unprotected {
    fn drop(&mut self) {
        async_defer! {
            async {
                if let Err(error) = self.lvm.protect(&self.lv).await {
                    tracing::error!("Failed to protect {} again: {error:#}", self.lv);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::testutils::FakeHost;

    #[rstest]
    #[case("Image-1.0-0", true)]
    #[case("Image-1.0-0+1", true)]
    #[case("_tmp.x", true)]
    #[case("-leading-dash", false)]
    #[case("with space", false)]
    #[case("slash/inside", false)]
    #[case("", false)]
    fn test_validate_name(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(validate_name(name).is_ok(), valid, "{name}");
    }

    #[test]
    fn test_validate_name_length() {
        assert!(validate_name(&"a".repeat(55)).is_ok());
        let error = validate_name(&"a".repeat(56)).unwrap_err();
        assert!(matches!(Error::find(&error), Some(Error::InvalidName(_))));
    }

    #[rstest]
    #[case("10737418240", 10737418240.0)]
    #[case("  12.50", 12.5)]
    #[case("12,50", 12.5)]
    #[case("", 0.0)]
    fn test_parse_number(#[case] value: &str, #[case] expected: f64) -> Result<()> {
        assert_eq!(parse_number(value)?, expected);
        Ok(())
    }

    #[rstest]
    #[case("Vwi-a-tz--", true, false, true, true, false)]
    #[case("Vri---tz-k", true, false, false, false, true)]
    #[case("twi-aotz--", false, true, true, true, false)]
    #[case("-wi-ao----", false, false, true, true, false)]
    fn test_lv_attributes(
        #[case] attr: &str,
        #[case] thin: bool,
        #[case] pool: bool,
        #[case] writable: bool,
        #[case] active: bool,
        #[case] activation_skip: bool,
    ) -> Result<()> {
        let parsed = attr.parse::<LvAttributes>()?;
        assert_eq!(
            parsed,
            LvAttributes {
                thin,
                pool,
                writable,
                active,
                activation_skip
            }
        );
        Ok(())
    }

    #[test]
    fn test_lv_from_str() -> Result<()> {
        assert_eq!(
            "hostvg/root".parse::<LogicalVolume>()?,
            LogicalVolume::new("hostvg", "root")
        );
        assert_eq!(
            "/dev/hostvg/root".parse::<LogicalVolume>()?,
            LogicalVolume::new("hostvg", "root")
        );
        assert!("root".parse::<LogicalVolume>().is_err());
        assert!("a/b/c".parse::<LogicalVolume>().is_err());
        Ok(())
    }

    fn fake_lvm() -> (Arc<FakeHost>, Lvm) {
        let host = Arc::new(FakeHost::with_thin_root("hostvg", "pool0", "root", 10 << 30));
        let lvm = Lvm::new(Runner::with_executor(host.clone(), false));
        (host, lvm)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_snapshot_and_origin() -> Result<()> {
        let (_host, lvm) = fake_lvm();
        let root = LogicalVolume::new("hostvg", "root");

        let snap = lvm.snapshot(&root, "root-snap").await?;
        assert_eq!(lvm.origin(&snap).await?, Some(root.clone()));
        assert_eq!(lvm.origin(&root).await?, None);
        assert_eq!(lvm.size_bytes(&snap).await?, 10 << 30);
        assert_eq!(lvm.thinpool(&snap).await?, LogicalVolume::new("hostvg", "pool0"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_thinpool_of_pool_fails() -> Result<()> {
        let (_host, lvm) = fake_lvm();
        let error = lvm
            .thinpool(&LogicalVolume::new("hostvg", "pool0"))
            .await
            .unwrap_err();
        assert!(matches!(Error::find(&error), Some(Error::MissingThinPool(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_protect_unprotect() -> Result<()> {
        let (_host, lvm) = fake_lvm();
        let root = LogicalVolume::new("hostvg", "root");

        lvm.protect(&root).await?;
        let attrs = lvm.attributes(&root).await?;
        assert!(!attrs.writable && !attrs.active && attrs.activation_skip);

        lvm.unprotect(&root).await?;
        let attrs = lvm.attributes(&root).await?;
        assert!(attrs.writable && attrs.active && !attrs.activation_skip);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unprotected_guard_protects_on_error() -> Result<()> {
        let (_host, lvm) = fake_lvm();
        let root = LogicalVolume::new("hostvg", "root");
        lvm.protect(&root).await?;

        let result: Result<()> = async {
            let guard = lvm.unprotected(&root).await?;
            assert!(lvm.attributes(guard.lv()).await?.writable);
            bail!("copy failed")
        }
        .await;

        assert!(result.is_err());
        let attrs = lvm.attributes(&root).await?;
        assert!(!attrs.writable && !attrs.active);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tags_and_lookup() -> Result<()> {
        let (_host, lvm) = fake_lvm();
        let root = LogicalVolume::new("hostvg", "root");

        lvm.add_tag(&root, TAG_BASE).await?;
        assert_eq!(lvm.tags(&root).await?, vec![TAG_BASE.to_owned()]);
        assert_eq!(lvm.lv_by_tag(TAG_BASE).await?, root);
        assert_eq!(lvm.try_find(&format!("@{TAG_BASE}")).await?, root);
        assert_eq!(lvm.try_find("hostvg/root").await?, root);
        assert_eq!(lvm.try_find("/dev/hostvg/root").await?, root);
        assert!(lvm.try_find("hostvg/missing").await.is_err());

        let vg = VolumeGroup {
            name: "hostvg".into(),
        };
        lvm.vg_add_tag(&vg, TAG_VG).await?;
        assert_eq!(lvm.vg_by_tag(TAG_VG).await?, vg);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rename_and_remove() -> Result<()> {
        let (_host, lvm) = fake_lvm();
        let root = LogicalVolume::new("hostvg", "root");

        let renamed = lvm.rename(&root, "Image-1.0-0").await?;
        assert!(!lvm.exists(&root).await?);
        assert!(lvm.exists(&renamed).await?);

        lvm.remove(&renamed).await?;
        assert!(!lvm.exists(&renamed).await?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_thin_rejects_invalid_name() -> Result<()> {
        let (host, lvm) = fake_lvm();
        let pool = LogicalVolume::new("hostvg", "pool0");
        assert!(lvm.create_thin(&pool, "bad name", 1 << 30).await.is_err());
        assert!(host.calls_of("lvcreate").is_empty());
        Ok(())
    }
}

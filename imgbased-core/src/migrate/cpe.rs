use std::{path::Path, str::FromStr};

use anyhow::{bail, Result};

use crate::fs::read_optional;

pub const CPE_FILE: &str = "etc/system-release-cpe";

/// Products whose layers may be migrated into each other.
pub const ALLOWED_PRODUCTS: &[&str] = &["fedora", "centos", "enterprise_linux"];

/// `cpe:/o:<vendor>:<product>:<version>` as found in `/etc/system-release-cpe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpe {
    pub vendor: String,
    pub product: String,
    pub version: String,
}

impl FromStr for Cpe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let line = s.lines().next().unwrap_or_default().trim();
        let Some(rest) = line.strip_prefix("cpe:/o:") else {
            bail!("Not an operating system CPE: {line:?}");
        };
        let mut parts = rest.split(':');
        let vendor = parts.next().unwrap_or_default();
        let product = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        if vendor.is_empty() || product.is_empty() {
            bail!("Incomplete CPE: {line:?}");
        }
        Ok(Self {
            vendor: vendor.to_owned(),
            product: product.to_owned(),
            version: version.to_owned(),
        })
    }
}

impl Cpe {
    /// Read the CPE of the tree mounted at `root`, `None` when the file is missing.
    pub async fn of_root(root: impl AsRef<Path>) -> Result<Option<Self>> {
        read_optional(root.as_ref().join(CPE_FILE))
            .await?
            .map(|content| content.parse())
            .transpose()
    }

    pub fn is_allowed(&self) -> bool {
        ALLOWED_PRODUCTS.contains(&self.product.as_str())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("cpe:/o:redhat:enterprise_linux:9.2:ga\n", "redhat", "enterprise_linux", "9.2", true)]
    #[case("cpe:/o:centos:centos:8", "centos", "centos", "8", true)]
    #[case("cpe:/o:fedoraproject:fedora:40", "fedoraproject", "fedora", "40", true)]
    #[case("cpe:/o:opensuse:leap:15.5", "opensuse", "leap", "15.5", false)]
    fn test_parse(
        #[case] content: &str,
        #[case] vendor: &str,
        #[case] product: &str,
        #[case] version: &str,
        #[case] allowed: bool,
    ) -> Result<()> {
        let cpe: Cpe = content.parse()?;
        assert_eq!(cpe.vendor, vendor);
        assert_eq!(cpe.product, product);
        assert_eq!(cpe.version, version);
        assert_eq!(cpe.is_allowed(), allowed);
        Ok(())
    }

    #[rstest]
    #[case("")]
    #[case("cpe:/a:vendor:app:1")]
    #[case("cpe:/o:vendor")]
    fn test_parse_rejects(#[case] content: &str) {
        assert!(content.parse::<Cpe>().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(Cpe::of_root(dir.path()).await?, None);
        Ok(())
    }
}

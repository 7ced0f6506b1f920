use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use strum::{Display, EnumIter};

use crate::{
    fs,
    runner::{Invocation, Runner},
};

pub const DEFAULT_DBPATH: &str = "/var/lib/rpm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum ScriptKind {
    #[strum(serialize = "%pre")]
    Pre,
    #[strum(serialize = "%post")]
    Post,
    #[strum(serialize = "%preun")]
    PreUn,
    #[strum(serialize = "%postun")]
    PostUn,
}

impl ScriptKind {
    fn query_tag(&self) -> &'static str {
        match self {
            ScriptKind::Pre => "%{PREIN}",
            ScriptKind::Post => "%{POSTIN}",
            ScriptKind::PreUn => "%{PREUN}",
            ScriptKind::PostUn => "%{POSTUN}",
        }
    }
}

/// Reads the package database of the tree at `root`.
pub struct RpmDb {
    runner: Runner,
    root: PathBuf,
    dbpath: PathBuf,
}

impl RpmDb {
    pub fn at(runner: &Runner, root: impl AsRef<Path>) -> Self {
        Self {
            runner: runner.clone(),
            root: root.as_ref().to_path_buf(),
            dbpath: PathBuf::from(DEFAULT_DBPATH),
        }
    }

    pub fn with_dbpath(mut self, dbpath: impl AsRef<Path>) -> Self {
        self.dbpath = dbpath.as_ref().to_path_buf();
        self
    }

    /// Stale Berkeley DB environment files left behind by another rpm make queries hang.
    async fn clean_locks(&self) -> Result<()> {
        let dbdir = self
            .root
            .join(self.dbpath.strip_prefix("/").unwrap_or(&self.dbpath));
        let pattern = dbdir.join("__db*");
        let pattern = pattern.to_string_lossy();

        for path in glob::glob(&pattern)
            .with_context(|| format!("Invalid glob pattern {pattern:?}"))?
            .flatten()
        {
            tracing::debug!("Removing stale rpm lock {path:?}");
            fs::remove_path(&self.runner, &path).await?;
        }
        Ok(())
    }

    fn rpm(&self) -> Invocation {
        Invocation::new("rpm")
            .arg("--root")
            .arg(&self.root)
            .arg("--dbpath")
            .arg(&self.dbpath)
            .read_only()
    }

    async fn query(&self, invocation: Invocation) -> Result<Vec<String>> {
        self.clean_locks().await?;
        let output = self.runner.run_unchecked(invocation.clone()).await?;
        match output.code {
            Some(0) => Ok(output
                .stdout_text()
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(ToOwned::to_owned)
                .collect()),
            // "no package provides" and "package is not installed"
            Some(1) => Ok(vec![]),
            code => anyhow::bail!(
                "rpm query {invocation} failed with {code:?}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }

    pub async fn installed(&self) -> Result<Vec<String>> {
        let mut packages = self
            .query(self.rpm().args(["-qa", "--qf", "%{NAME}\n"]))
            .await
            .context("Failed to list installed packages")?;
        packages.sort();
        packages.dedup();
        Ok(packages)
    }

    pub async fn providers_of(&self, capability: &str) -> Result<Vec<String>> {
        self.query(
            self.rpm()
                .args(["-q", "--whatprovides", capability, "--qf", "%{NVRA}\n"]),
        )
        .await
        .with_context(|| format!("Failed to find providers of {capability}"))
    }

    pub async fn files_of(&self, package: &str) -> Result<Vec<String>> {
        self.query(self.rpm().args(["-ql", package]))
            .await
            .with_context(|| format!("Failed to list files of {package}"))
    }

    pub async fn script_of(&self, package: &str, kind: ScriptKind) -> Result<Option<String>> {
        self.clean_locks().await?;
        let output = self
            .runner
            .run_unchecked(self.rpm().args(["-q", "--qf", kind.query_tag(), package]))
            .await
            .with_context(|| format!("Failed to read {kind} of {package}"))?;
        if output.code != Some(0) {
            return Ok(None);
        }
        let script = output.stdout_text();
        Ok((!script.is_empty() && script != "(none)").then_some(script))
    }
}

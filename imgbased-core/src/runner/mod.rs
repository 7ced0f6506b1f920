pub mod exec;
pub mod safe_write;

use std::{
    ffi::OsStr,
    fmt::Display,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;

use crate::error::Error;

pub use exec::SystemExecutor;

/// A single invocation of an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    /// Queries which never change host state. They keep running in dry-run mode.
    pub read_only: bool,
}

impl Invocation {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            argv: vec![program.as_ref().to_string_lossy().into_owned()],
            env: vec![],
            cwd: None,
            stdin: None,
            read_only: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.argv.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let quoted = self
            .argv
            .iter()
            .map(|arg| shlex::try_quote(arg).map_or_else(|_| arg.clone(), |q| q.into_owned()))
            .collect::<Vec<_>>();
        write!(f, "{}", quoted.join(" "))
    }
}

/// Raw result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Output {
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: vec![],
        }
    }

    pub fn failure(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            code: Some(code),
            stdout: vec![],
            stderr: stderr.into(),
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim_end().to_owned()
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, invocation: &Invocation) -> Result<Output>;
}

/// Entry point for every external command. Carries the dry-run switch explicitly instead of a
/// process wide flag.
#[derive(Clone)]
pub struct Runner {
    executor: Arc<dyn CommandExecutor>,
    dry_run: bool,
}

impl Runner {
    pub fn system(dry_run: bool) -> Self {
        Self::with_executor(Arc::new(SystemExecutor), dry_run)
    }

    pub fn with_executor(executor: Arc<dyn CommandExecutor>, dry_run: bool) -> Self {
        Self { executor, dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run the invocation and return its stdout, decoded lossily and with trailing whitespace
    /// removed. A non-zero exit becomes [`Error::CommandFailed`].
    pub async fn run(&self, invocation: Invocation) -> Result<String> {
        let output = self.run_unchecked(invocation.clone()).await?;
        match output.code {
            Some(0) => Ok(output.stdout_text()),
            code => Err(Error::CommandFailed {
                argv: invocation.argv,
                exit: code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }
            .into()),
        }
    }

    /// Run the invocation and hand back the raw output regardless of the exit code.
    pub async fn run_unchecked(&self, invocation: Invocation) -> Result<Output> {
        if self.dry_run && !invocation.read_only {
            tracing::info!("(dry-run) {invocation}");
            return Ok(Output::success(vec![]));
        }

        tracing::trace!(cmd = %invocation, "run external cmd");
        self.executor.execute(&invocation).await
    }

    pub async fn call<I, S>(&self, program: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run(Invocation::new(program).args(args)).await
    }

    pub async fn query<I, S>(&self, program: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run(Invocation::new(program).args(args).read_only())
            .await
    }
}

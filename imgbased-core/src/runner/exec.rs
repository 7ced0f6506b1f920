use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt as _, process::Command};

use super::{CommandExecutor, Invocation, Output};

/// Executes invocations as real child processes.
///
/// Descriptors opened by the standard library carry `O_CLOEXEC`, so the child only inherits the
/// three pipes set up here.
pub struct SystemExecutor;

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<Output> {
        let mut cmd = Command::new(invocation.program());
        cmd.args(&invocation.argv[1..]);

        // reset all locale settings for this command, so that the output can be parsed
        cmd.env("LC_ALL", "C");
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }

        async {
            if invocation.stdin.is_some() {
                cmd.stdin(Stdio::piped());
            } else {
                cmd.stdin(Stdio::null());
            }
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());

            let mut child = cmd.kill_on_drop(true).spawn()?;

            if let Some(input_bytes) = &invocation.stdin {
                let mut stdin = child.stdin.take().context("No stdin")?;
                stdin.write_all(input_bytes).await?;
                stdin.shutdown().await?;
            }

            let output = child.wait_with_output().await?;

            tracing::trace!(
                cmd = %invocation,
                code = ?output.status.code(),
                "external cmd finished"
            );

            Ok::<_, anyhow::Error>(Output {
                code: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
        .await
        .with_context(|| format!("Failed to execute external command: {invocation}"))
    }
}

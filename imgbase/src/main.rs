use anyhow::Result;
use clap::Parser as _;
use imgbase::{build, cli::Cli, cmd::IntoCommand as _};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let default_level = if args.global.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_level.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::debug!(
        "imgbase version: v{}  commit: {}  buildtime: {}",
        build::PKG_VERSION,
        build::COMMIT_HASH,
        build::BUILD_TIME
    );

    if !args.global.dry && !nix::unistd::geteuid().is_root() {
        tracing::warn!("Not running as root, changes to the host are likely to fail");
    }

    // Handle the command
    args.into_command().run().await?;

    Ok(())
}

use super::Cli;
use crate::sshd;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tracing::info;

#[derive(Debug, Args)]
pub struct ServiceSubcommands {
    #[clap(subcommand)]
    pub command: ServiceCommands,
}

#[derive(Debug, Subcommand)]
pub enum ServiceCommands {
    /// Start the pushbuild SSH service.
    #[clap(
        long_about = "Pushbuild listens for git pushes over SSH. Running this command attempts to start the long
    running service. This command will block until the process is stopped."
    )]
    Start,
}

impl Cli {
    pub async fn service_start(&self) -> Result<()> {
        info!(
            semver = env!("BUILD_SEMVER"),
            commit = env!("BUILD_COMMIT"),
            git_home = %self.conf.git.home.display(),
            "Starting pushbuild"
        );

        sshd::Server::new(&self.conf, self.config_path.clone())
            .run(&self.conf.sshd)
            .await
            .context("SSH service stopped unexpectedly")?;

        Ok(())
    }
}

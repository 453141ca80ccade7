mod git_receive;
mod service;

use crate::{conf, gitreceive};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "pushbuild")]
#[clap(about = "Pushbuild turns a git push into a container build.")]
#[clap(
    long_about = "Pushbuild turns a git push into a container build.\n\n It accepts pushes over SSH, stores them in a
    bare repository and launches a build job on the container scheduler for every pushed commit. The job output is
    streamed back to the pusher."
)]
#[clap(version)]
struct Args {
    /// Set configuration path; if empty default paths are used
    #[clap(long, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manages service related commands pertaining to administration.
    Service(service::ServiceSubcommands),

    /// Builds every ref update read from stdin. Run by the pre-receive hook; not meant to be called by hand.
    #[clap(hide = true)]
    GitReceive(gitreceive::HookContext),
}

pub struct Cli {
    conf: conf::Config,
    /// Absolute so the pre-receive hook can load it from inside a repository.
    config_path: Option<PathBuf>,
    command: Commands,
}

impl Cli {
    pub fn new() -> Result<Self> {
        let args = Args::parse();

        let conf = conf::Config::load(args.config_path.as_deref())
            .context("Could not load configuration")?;

        init_logging(&conf.general)?;

        let config_path = args
            .config_path
            .map(|path| std::fs::canonicalize(&path).unwrap_or(path));

        Ok(Self {
            conf,
            config_path,
            command: args.command,
        })
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Service(ref subcommands) => match subcommands.command {
                service::ServiceCommands::Start => self.service_start().await,
            },
            Commands::GitReceive(ref ctx) => self.git_receive(ctx).await,
        }
    }
}

/// Logs always go to stderr; for the hook, stdout is the pusher's progress stream.
fn init_logging(config: &conf::General) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("Could not parse log_level '{}'", config.log_level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if config.dev_mode {
        builder.pretty().try_init()
    } else {
        builder.json().try_init()
    };

    result.map_err(|e| anyhow!("Could not init logging; {e}"))
}

//! Everything that happens after git has accepted a push: turning ref updates into build jobs and watching them.

pub mod job;
pub mod sha;
pub mod storage;
pub mod supervisor;


use crate::{conf, git, object_store, scheduler};
use clap::Args;
use job::{BuildJobComposer, Strategy, BUILDPACK_URL_ENV, IMG_NAME_ENV};
use sha::{GitSha, InvalidShaError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use storage::StorageLocations;
use supervisor::{BuildError, BuildSupervisor};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Presence of this file at the root of the pushed tree selects a docker build.
const DOCKERFILE: &str = "Dockerfile";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed ref update line [{0}]")]
pub struct RefLineError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("reading ref updates; {0}")]
    RefLine(#[from] RefLineError),

    #[error("reading ref updates; {0}")]
    Input(#[source] std::io::Error),

    #[error(transparent)]
    InvalidSha(#[from] InvalidShaError),

    #[error("could not read pushed source; {0}")]
    Source(#[from] git::GitError),

    #[error("could not store source tarball; {0}")]
    Storage(#[source] object_store::ObjectStoreError),

    #[error("could not load config for app '{app}'; {reason}")]
    AppConfig { app: String, reason: String },

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// A single `old-sha new-sha ref-name` line git hands the pre-receive hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old: String,
    pub new: String,
    pub ref_name: String,
}

/// Parses one ref update line. Anything other than exactly three space separated tokens is rejected.
pub fn read_line(line: &str) -> Result<RefUpdate, RefLineError> {
    let tokens: Vec<&str> = line.split(' ').collect();

    let [old, new, ref_name] = tokens.as_slice() else {
        return Err(RefLineError(line.to_string()));
    };

    Ok(RefUpdate {
        old: old.to_string(),
        new: new.to_string(),
        ref_name: ref_name.to_string(),
    })
}

/// What the pre-receive hook passes to `pushbuild git-receive`.
#[derive(Debug, Clone, Args, PartialEq, Eq)]
pub struct HookContext {
    /// Directory holding every bare repository.
    #[clap(long, env = "GIT_HOME")]
    pub git_home: PathBuf,

    /// Repository being pushed to, e.g. `demo.git`.
    #[clap(long, env = "REPOSITORY")]
    pub repository: String,

    #[clap(long, env = "USERNAME", default_value = "")]
    pub username: String,

    #[clap(long, env = "FINGERPRINT", default_value = "")]
    pub fingerprint: String,

    /// The command the ssh client ran; builds only happen for receive-pack.
    #[clap(long, env = "SSH_ORIGINAL_COMMAND", default_value = "")]
    pub ssh_original_command: String,

    #[clap(long, env = "SSH_CONNECTION", default_value = "0 0 0 0")]
    pub ssh_connection: String,
}

impl HookContext {
    pub fn is_receive_pack(&self) -> bool {
        self.ssh_original_command.starts_with(git::RECEIVE_PACK)
    }

    /// The application name, which is the repository name without its `.git` suffix.
    pub fn app(&self) -> &str {
        self.repository
            .strip_suffix(".git")
            .unwrap_or(&self.repository)
    }

    pub fn repo_path(&self) -> PathBuf {
        self.git_home.join(&self.repository)
    }
}

/// Key holding an app's build environment as a JSON object of strings.
pub fn app_config_key(app: &str) -> String {
    format!("config/{app}/env.json")
}

/// Drives one push from ref updates to finished builds.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    endpoint: String,
    store: Arc<dyn object_store::ObjectStore>,
    composer: BuildJobComposer,
    supervisor: BuildSupervisor,
}

impl Orchestrator {
    pub fn new(
        config: &conf::Config,
        store: Arc<dyn object_store::ObjectStore>,
        scheduler: Arc<dyn scheduler::Scheduler>,
    ) -> Self {
        Self {
            endpoint: config.object_store.endpoint.clone(),
            store,
            composer: BuildJobComposer::new(&config.build),
            supervisor: BuildSupervisor::from_config(scheduler, &config.build),
        }
    }

    /// Processes every ref update on `input` in order. The first failure stops the push.
    pub async fn run<R, W>(
        &self,
        ctx: &HookContext,
        input: R,
        output: &mut W,
    ) -> Result<(), OrchestratorError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send,
    {
        debug!(repository = %ctx.repository, user = %ctx.username, "Running git hook");

        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.map_err(OrchestratorError::Input)? {
            let update = read_line(&line)?;

            debug!(old = %update.old, new = %update.new, ref_name = %update.ref_name, "Read ref update");

            if ctx.is_receive_pack() {
                self.build(ctx, &update, output).await?;
            }
        }

        Ok(())
    }

    async fn build<W>(
        &self,
        ctx: &HookContext,
        update: &RefUpdate,
        output: &mut W,
    ) -> Result<(), OrchestratorError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let sha = GitSha::new(&update.new)?;
        let app = ctx.app();
        let repo_path = ctx.repo_path();
        let locations = StorageLocations::new(&self.endpoint, app, app, &sha);

        progress(output, &format!("-----> Building {app} at {}", sha.short())).await;

        let tarball = git::archive(&repo_path, sha.full()).await?;
        self.store
            .put(&locations.tar_key, tarball, true)
            .await
            .map_err(OrchestratorError::Storage)?;

        debug!(key = %locations.tar_key, "Uploaded source tarball");

        // Build overrides live in the app config but are handed to the composer rather than passed through.
        let mut env = self.app_env(app).await?;
        let buildpack_url = env.remove(BUILDPACK_URL_ENV);
        let image_name = env.remove(IMG_NAME_ENV);

        let strategy = if git::tree_has_file(&repo_path, sha.full(), DOCKERFILE).await? {
            Strategy::Docker { image_name }
        } else {
            Strategy::Slug { buildpack_url }
        };

        let spec = self
            .composer
            .compose(strategy, app, &sha, &env, &locations);

        info!(
            app = %app,
            sha = %sha,
            job = %spec.name,
            strategy = %spec.strategy,
            "Starting build"
        );
        progress(output, &format!("-----> Starting {} build {}", spec.strategy, spec.name)).await;

        self.supervisor.run(spec, output).await?;

        progress(output, "-----> Build complete").await;

        Ok(())
    }

    /// Loads the app's environment. An app that has never been configured builds with an empty one.
    async fn app_env(&self, app: &str) -> Result<BTreeMap<String, String>, OrchestratorError> {
        let raw = match self.store.get(&app_config_key(app)).await {
            Ok(raw) => raw,
            Err(object_store::ObjectStoreError::NotFound) => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(OrchestratorError::AppConfig {
                    app: app.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        serde_json::from_slice(&raw).map_err(|e| OrchestratorError::AppConfig {
            app: app.to_string(),
            reason: e.to_string(),
        })
    }
}

async fn progress<W: AsyncWrite + Unpin>(output: &mut W, message: &str) {
    let _ = output.write_all(format!("{message}\n").as_bytes()).await;
    let _ = output.flush().await;
}

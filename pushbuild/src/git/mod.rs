//! The git side of a push: repository layout on disk and the `git-shell` subprocess that speaks the pack protocol.


use crate::conf;
use bytes::Bytes;
use dashmap::DashMap;
use lazy_regex::regex_is_match;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// The only pack protocol operation pushbuild serves.
pub const RECEIVE_PACK: &str = "git-receive-pack";

/// Identity label every accepted pusher is run as.
pub const RECEIVE_USER: &str = "builder";

const PRE_RECEIVE_HOOK_TEMPLATE: &str = r#"#!/bin/bash
set -o pipefail

strip_remote_prefix() {
    stdbuf -i0 -o0 -e0 sed "s/^/"$'\e[1G'"/"
}

GIT_HOME="{{ git_home }}" \
SSH_CONNECTION="$SSH_CONNECTION" \
SSH_ORIGINAL_COMMAND="$SSH_ORIGINAL_COMMAND" \
REPOSITORY="$RECEIVE_REPO" \
USERNAME="$RECEIVE_USER" \
FINGERPRINT="$RECEIVE_FINGERPRINT" \
pushbuild{% if config_path %} --config-path "{{ config_path }}"{% endif %} git-receive | strip_remote_prefix
"#;

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("invalid repository name; {0}")]
    InvalidRepoName(String),

    #[error("unsupported command '{0}'; only git-receive-pack is allowed")]
    UnsupportedCommand(String),

    #[error("pushing to '{0}' is not allowed")]
    Forbidden(String),

    #[error("could not prepare repository; {0}")]
    Repository(String),

    #[error("{message}; {stderr}")]
    Subprocess { message: String, stderr: String },
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("could not run git {command}; {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("git {command} failed; {stderr}")]
    Failed { command: String, stderr: String },
}

/// Turns the path a client asked for into the logical repository name.
///
/// Quotes are removed first, then every trailing `.git` and leading `/`. The result is a single path segment that is
/// also usable inside a container name, so nested names and anything that could walk out of the git home are
/// rejected. Cleaning an already clean name returns it unchanged.
pub fn clean_repo_name(name: &str) -> Result<String, ReceiveError> {
    let mut name = name.replace('\'', "");

    if name.is_empty() {
        return Err(ReceiveError::InvalidRepoName("empty repository name".into()));
    }

    if name.contains("..") {
        return Err(ReceiveError::InvalidRepoName(
            "cannot change directory in repository name".into(),
        ));
    }

    loop {
        let stripped = name.trim_start_matches('/');
        let stripped = stripped.strip_suffix(".git").unwrap_or(stripped);
        if stripped.len() == name.len() {
            break;
        }
        name = stripped.to_string();
    }

    if name.is_empty() {
        return Err(ReceiveError::InvalidRepoName("empty repository name".into()));
    }

    if !regex_is_match!(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$", &name) {
        return Err(ReceiveError::InvalidRepoName(format!(
            "'{name}' must be a single segment of letters, digits, '.', '_' or '-'"
        )));
    }

    Ok(name)
}

/// Renders the pre-receive hook that hands a finished push over to `pushbuild git-receive`.
///
/// When the service was started with an explicit config path the hook passes it on, so both halves of a push read
/// the same configuration.
pub fn render_pre_receive_hook(
    git_home: &Path,
    config_path: Option<&Path>,
) -> Result<String, tera::Error> {
    let mut tera = tera::Tera::default();
    tera.add_raw_template("pre-receive", PRE_RECEIVE_HOOK_TEMPLATE)?;

    let mut context = tera::Context::new();
    context.insert("git_home", &git_home.to_string_lossy());
    context.insert(
        "config_path",
        &config_path.map(|path| path.to_string_lossy().to_string()),
    );

    tera.render("pre-receive", &context)
}

/// Writes `hooks/pre-receive` into the repository, replacing whatever was there.
pub async fn write_pre_receive_hook(
    git_home: &Path,
    config_path: Option<&Path>,
    repo_path: &Path,
) -> Result<(), ReceiveError> {
    let hook = render_pre_receive_hook(git_home, config_path)
        .map_err(|e| ReceiveError::Repository(format!("could not render pre-receive hook; {e}")))?;

    let hooks_dir = repo_path.join("hooks");
    tokio::fs::create_dir_all(&hooks_dir).await.map_err(|e| {
        ReceiveError::Repository(format!("could not create {}; {e}", hooks_dir.display()))
    })?;

    let hook_path = hooks_dir.join("pre-receive");
    tokio::fs::write(&hook_path, hook).await.map_err(|e| {
        ReceiveError::Repository(format!("could not write {}; {e}", hook_path.display()))
    })?;

    tokio::fs::set_permissions(&hook_path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| {
            ReceiveError::Repository(format!(
                "could not make {} executable; {e}",
                hook_path.display()
            ))
        })?;

    Ok(())
}

/// Runs a git subcommand inside `repo_path`.
async fn git(repo_path: &Path, args: &[&str]) -> Result<std::process::Output, GitError> {
    let command = args.join(" ");

    debug!(repo = %repo_path.display(), command = %command, "Running git command");

    Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| GitError::Spawn { command, source })
}

/// Returns a gzipped tarball of the tree at `sha`.
pub async fn archive(repo_path: &Path, sha: &str) -> Result<Bytes, GitError> {
    let output = git(repo_path, &["archive", "--format=tar.gz", sha]).await?;

    if !output.status.success() {
        return Err(GitError::Failed {
            command: format!("archive {sha}"),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(Bytes::from(output.stdout))
}

/// Reports whether `file` exists at the root of the tree at `sha`.
pub async fn tree_has_file(repo_path: &Path, sha: &str, file: &str) -> Result<bool, GitError> {
    let object = format!("{sha}:{file}");
    let output = git(repo_path, &["cat-file", "-e", &object]).await?;

    Ok(output.status.success())
}

/// Everything the receiver needs to know about one accepted exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub operation: String,
    /// The repository path exactly as the client sent it, e.g. `/demo.git`.
    pub repo_path: String,
    pub fingerprint: String,
    /// `"<peer_ip> <peer_port> <local_ip> <local_port>"`
    pub ssh_connection: String,
}

/// Materializes bare repositories and runs `git-shell` against them.
#[derive(Debug, Clone)]
pub struct Receiver {
    git_home: PathBuf,
    shell: String,
    allowed_apps: Vec<String>,
    config_path: Option<PathBuf>,
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Receiver {
    pub fn new(config: &conf::Git) -> Self {
        Self {
            git_home: config.home.clone(),
            shell: config.shell.clone(),
            allowed_apps: config.allowed_apps.clone(),
            config_path: None,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Config file the pre-receive hook should load instead of the default paths.
    pub fn with_config_path(mut self, config_path: Option<PathBuf>) -> Self {
        self.config_path = config_path;
        self
    }

    /// Creates the bare repository at `path` unless it is already there.
    ///
    /// Returns true when this call created it. Concurrent calls for the same path are serialized so `git init` runs
    /// at most once per path.
    pub async fn create_repo(&self, path: &Path) -> Result<bool, ReceiveError> {
        // The map guard must be released before awaiting the mutex.
        let lock = self.locks.entry(path.to_path_buf()).or_default().clone();
        let _guard = lock.lock().await;

        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => return Ok(false),
            Ok(_) => {
                return Err(ReceiveError::Repository(format!(
                    "{} exists but is not a directory",
                    path.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ReceiveError::Repository(format!(
                    "could not stat {}; {e}",
                    path.display()
                )))
            }
        }

        tokio::fs::create_dir_all(path).await.map_err(|e| {
            ReceiveError::Repository(format!("could not create {}; {e}", path.display()))
        })?;

        let output = git(path, &["init", "--bare"])
            .await
            .map_err(|e| ReceiveError::Repository(e.to_string()))?;

        if !output.status.success() {
            return Err(ReceiveError::Repository(format!(
                "git init --bare {} failed; {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(repo = %path.display(), "Created new bare repository");

        Ok(true)
    }

    /// Prepares the repository for the request and runs `git-shell` with the channel wired to its stdio.
    ///
    /// Subprocess stderr goes to `errout` and is also captured so any failure carries what git said.
    pub async fn receive<R, W, E>(
        &self,
        request: &ReceiveRequest,
        mut input: R,
        mut output: W,
        mut errout: E,
    ) -> Result<(), ReceiveError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        debug!(
            repo = %request.repo_path,
            operation = %request.operation,
            fingerprint = %request.fingerprint,
            user = RECEIVE_USER,
            "Receiving git repository"
        );

        if request.operation != RECEIVE_PACK {
            let err = ReceiveError::UnsupportedCommand(request.operation.clone());
            report(&mut errout, &err).await;
            return Err(err);
        }

        let app = match clean_repo_name(&request.repo_path) {
            Ok(app) => app,
            Err(e) => {
                warn!(repo = %request.repo_path, error = %e, "Illegal repository name");
                report(&mut errout, &e).await;
                return Err(e);
            }
        };

        if !self.allowed_apps.is_empty() && !self.allowed_apps.contains(&app) {
            let err = ReceiveError::Forbidden(app);
            warn!(error = %err, "Push to application outside allow-list refused");
            report(&mut errout, &err).await;
            return Err(err);
        }

        let repo = format!("{app}.git");
        let repo_path = self.git_home.join(&repo);

        self.create_repo(&repo_path).await.map_err(|e| {
            warn!(repo = %repo_path.display(), error = %e, "Did not create new repository");
            e
        })?;

        write_pre_receive_hook(&self.git_home, self.config_path.as_deref(), &repo_path)
            .await
            .map_err(|e| {
                warn!(repo = %repo_path.display(), error = %e, "Did not write pre-receive hook");
                e
            })?;

        let command = format!("{} '{repo}'", request.operation);

        info!(shell = %self.shell, command = %command, "Starting git shell");

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&command)
            .current_dir(&self.git_home)
            .env("RECEIVE_USER", RECEIVE_USER)
            .env("RECEIVE_REPO", &repo)
            .env("RECEIVE_FINGERPRINT", &request.fingerprint)
            .env("SSH_ORIGINAL_COMMAND", &command)
            .env("SSH_CONNECTION", &request.ssh_connection)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ReceiveError::Subprocess {
                message: format!("failed to start {}", self.shell),
                stderr: e.to_string(),
            })?;

        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ReceiveError::Subprocess {
                message: "git shell stdio was not captured".into(),
                stderr: String::new(),
            });
        };

        let mut feed = Box::pin(async move {
            let copied = tokio::io::copy(&mut input, &mut stdin).await;
            // Dropping stdin here signals end of input to git.
            drop(stdin);
            copied
        });

        let relay_stdout = async {
            let copied = tokio::io::copy(&mut stdout, &mut output).await;
            let _ = output.flush().await;
            copied
        };

        let relay_stderr = async {
            let mut captured = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let read = match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => read,
                };
                captured.extend_from_slice(&chunk[..read]);
                if let Err(e) = errout.write_all(&chunk[..read]).await {
                    debug!(error = %e, "Could not relay git stderr to client");
                }
            }
            let _ = errout.flush().await;
            captured
        };

        let relay = async { tokio::join!(relay_stdout, relay_stderr) };
        tokio::pin!(relay);

        // Keep feeding input until git closes its output; whatever the client still sends after that is ignored.
        let mut fed = None;
        let (relayed, captured) = loop {
            tokio::select! {
                result = &mut feed, if fed.is_none() => fed = Some(result),
                outputs = &mut relay => break outputs,
            }
        };
        drop(feed);

        let captured = String::from_utf8_lossy(&captured).trim().to_string();

        let status = child.wait().await.map_err(|e| ReceiveError::Subprocess {
            message: format!("failed to run git pre-receive hook; {e}"),
            stderr: captured.clone(),
        })?;

        if !status.success() {
            error!(status = %status, stderr = %captured, "Git shell exited unsuccessfully");
            return Err(ReceiveError::Subprocess {
                message: format!("failed to run git pre-receive hook; {status}"),
                stderr: captured,
            });
        }

        if let Some(Err(e)) = fed {
            return Err(ReceiveError::Subprocess {
                message: format!("failed to write git objects into git-receive-pack; {e}"),
                stderr: captured,
            });
        }

        if let Err(e) = relayed {
            return Err(ReceiveError::Subprocess {
                message: format!("failed to relay git output to client; {e}"),
                stderr: captured,
            });
        }

        if !captured.is_empty() {
            warn!(stderr = %captured, "Unreported error output from git shell");
        }

        info!(repo = %repo, "Push received");

        Ok(())
    }
}

async fn report<E: AsyncWrite + Unpin>(errout: &mut E, err: &ReceiveError) {
    let _ = errout.write_all(format!("{err}\n").as_bytes()).await;
    let _ = errout.flush().await;
}

use crate::{object_store, scheduler};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_embed::RustEmbed;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(RustEmbed)]
#[folder = "src/conf/"]
#[include = "*.toml"]
struct EmbeddedConfigFS;

const DEFAULT_CONFIG_FILE: &str = "default_config.toml";
const DEFAULT_CONFIG_PATH: &str = "/etc/pushbuild/pushbuild.toml";
const ENV_PREFIX: &str = "PUSHBUILD_";

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub sshd: Sshd,
    pub git: Git,
    pub build: Build,
    pub object_store: ObjectStore,
    pub scheduler: Scheduler,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct General {
    /// Turns on humanized log output instead of json. Usually turned on along side log_level=debug.
    pub dev_mode: bool,
    pub log_level: String,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Sshd {
    pub listen_address: String,
    /// The host key types that are attempted on startup; each is substituted into `host_key_path`.
    pub host_key_types: Vec<String>,
    /// Path template for host keys. `{key_type}` is replaced with each entry of `host_key_types`.
    pub host_key_path: String,
    /// The single public key (authorized_keys format) that is allowed to push.
    pub authorized_key_path: PathBuf,
    pub inactivity_timeout: u64,  // in seconds
    pub auth_rejection_time: u64, // in seconds
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Git {
    /// Root directory that holds every bare repository.
    pub home: PathBuf,
    /// The restricted shell used to run git-receive-pack.
    pub shell: String,
    /// When non-empty only these application names may be pushed to.
    pub allowed_apps: Vec<String>,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub namespace: String,
    pub debug: bool,
    pub slug_builder_image: String,
    pub docker_builder_image: String,
    /// Registry host that docker builds push their images to.
    pub registry: String,
    /// Name of the secret holding registry credentials. Empty means the registry needs no auth.
    pub registry_secret: String,
    pub always_pull: bool,
    /// Credentials for pulling the builder images themselves.
    pub pull_auth: Option<PullAuth>,
    pub timeout: u64,       // in seconds
    pub poll_interval: u64, // in seconds
    pub log_tail_lines: usize,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct PullAuth {
    pub user: String,
    pub pass: String,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct ObjectStore {
    pub engine: object_store::Engine,
    /// Root of the URLs handed to build jobs. Keys are joined onto `<endpoint>/git/`.
    pub endpoint: String,
    pub filesystem: Option<object_store::filesystem::Config>,
    pub s3: Option<object_store::s3::Config>,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Scheduler {
    pub engine: scheduler::Engine,
    pub docker: Option<scheduler::docker::Config>,
}

impl Config {
    /// Returns a deserialized config built from the embedded defaults, the config file and then the environment.
    ///
    /// Later sources override earlier ones. Environment variables use the `PUSHBUILD_` prefix and `__` to separate
    /// nested keys, so `PUSHBUILD_GIT__HOME=/srv/git` sets `git.home`.
    pub fn load(path_override: Option<&Path>) -> Result<Self, figment::Error> {
        let default_config = EmbeddedConfigFS::get(DEFAULT_CONFIG_FILE).ok_or_else(|| {
            figment::Error::from(format!("missing embedded {DEFAULT_CONFIG_FILE}"))
        })?;
        let default_config = std::str::from_utf8(&default_config.data)
            .map_err(|e| figment::Error::from(e.to_string()))?
            .to_string();

        let path = path_override.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        Figment::new()
            .merge(Toml::string(&default_config))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }
}

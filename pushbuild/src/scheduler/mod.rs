pub mod docker;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use strum::{Display, EnumString};

/// Represents different scheduler failure possibilities.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Failed to start scheduler due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init scheduler; {0}")]
    FailedSchedulerPrecondition(String),

    /// Failed to communicate with scheduler due to network error or other.
    #[error("could not connect to scheduler; {0}")]
    Connection(String),

    /// A container with the requested name is already known to the scheduler.
    #[error("container already exists; {0}")]
    Exists(String),

    /// Container requested by name could not be found.
    #[error("container not found; {0}")]
    NoSuchContainer(String),

    /// Image requested by name could not be found or pulled.
    #[error("docker image not found; {0}")]
    NoSuchImage(String),

    /// An expected and unknown error has occurred.
    #[error("unexpected scheduler error occurred; {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ContainerState {
    Unknown,
    Running,
    Exited,
}

/// Private repositories sometimes require authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub user: String,
    pub pass: String,
}

/// A named secret made available read-only to the container at `mount_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretVolume {
    pub secret: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartContainerRequest {
    /// A unique identifier to identify the container with. The scheduler refuses duplicates.
    pub id: String,
    /// The namespace the container is scoped to; secrets are only looked up within it.
    pub namespace: String,
    /// The docker image repository and docker image name; tag can be included.
    pub image: String,
    /// Environment variables to be passed to the container.
    pub variables: HashMap<String, String>,
    /// Registry authentication details used to pull the image.
    pub registry_auth: Option<RegistryAuth>,
    /// Attempt to pull the container from the upstream repository even if it exists already locally.
    /// This is useful if your containers don't use proper tagging or versioning.
    pub always_pull: bool,
    /// Replaces container's entrypoint with a custom one.
    pub entrypoint: Option<Vec<String>>,
    /// Replaces container's cmd instruction with a custom one.
    pub command: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    pub secret_volumes: Vec<SecretVolume>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartContainerResponse {
    /// An optional, unique way for the scheduler to identify the container. Sometimes the scheduler
    /// will not be able to use the client provided container name as a unique identifier and will
    /// return it's own identifier.
    pub scheduler_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStateRequest {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStateResponse {
    /// In the event that the container is in a "complete" state; the exit code of that container.
    pub exit_code: Option<i64>,
    /// The current state of the container, state referencing how complete the container process of running is.
    pub state: ContainerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetLogsRequest {
    pub id: String,
    /// Keep the stream open until the container exits.
    pub follow: bool,
    /// Only return the last N lines.
    pub tail: Option<usize>,
}

/// Represents a single log line/entry from a particular container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Log {
    Unknown,
    Stdout(bytes::Bytes),
    Stderr(bytes::Bytes),
}

pub type LogStream = Pin<Box<dyn Stream<Item = Result<Log, SchedulerError>> + Send>>;

/// The scheduler trait defines what the interface between pushbuild and a container scheduler should look like.
#[async_trait]
pub trait Scheduler: Debug + Send + Sync {
    /// Start a container based on details passed; Should implement automatically pulling and registry auth
    /// of container if necessary.
    async fn start_container(
        &self,
        req: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError>;

    /// Get the current state of container and potential exit code.
    async fn get_state(&self, req: GetStateRequest) -> Result<GetStateResponse, SchedulerError>;

    /// Returns a stream of logs from the container.
    fn get_logs(&self, req: GetLogsRequest) -> LogStream;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    #[default]
    Docker,
}

pub async fn init_scheduler(
    config: &crate::conf::Scheduler,
) -> Result<Arc<dyn Scheduler>, SchedulerError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::Docker => {
            let Some(docker_config) = &config.docker else {
                return Err(SchedulerError::FailedSchedulerPrecondition(
                    "docker engine settings not found in config".into(),
                ));
            };

            let engine = docker::Scheduler::new(docker_config).await?;
            Ok(Arc::new(engine))
        }
    }
}

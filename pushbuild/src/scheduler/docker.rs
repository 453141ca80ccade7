use super::{
    ContainerState, GetLogsRequest, GetStateRequest, GetStateResponse, Log, LogStream,
    SchedulerError, SecretVolume, StartContainerRequest, StartContainerResponse,
};
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument};

/// Label every container is tagged with so operators can find the builds of one namespace.
pub const NAMESPACE_LABEL: &str = "pushbuild.namespace";

fn format_env_var(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

/// Secrets are scoped to a namespace: a container can only mount secrets that live under its own namespace
/// directory.
fn format_secret_bind(secrets_path: &Path, namespace: &str, volume: &SecretVolume) -> String {
    format!(
        "{}:{}:ro",
        secrets_path
            .join(namespace)
            .join(&volume.secret)
            .to_string_lossy(),
        volume.mount_path
    )
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub prune: bool,
    pub prune_interval: u64, // in seconds
    /// The total amount of time any request is allowed to be pending for in seconds.
    pub timeout: u64,
    /// Host directory holding `<namespace>/<secret>` directories that get bind mounted into build containers.
    pub secrets_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    client: bollard::Docker,
    secrets_path: PathBuf,
}

impl Scheduler {
    #[instrument(fields(origin = "scheduler::docker"))]
    pub async fn new(config: &Config) -> Result<Self, SchedulerError> {
        let client = bollard::Docker::connect_with_socket_defaults().map_err(|e| {
            SchedulerError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;
        let client = client.with_timeout(tokio::time::Duration::from_secs(config.timeout));

        // Check that we can actually get a connection.
        let version = client.version().await.map_err(|e| {
            SchedulerError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;

        // Finished build containers are only ever removed by this prune. Containers younger than one interval are
        // left alone so a supervisor can still read the exit code of a build that just finished.
        if config.prune {
            tokio::spawn(prune_containers(client.clone(), config.prune_interval));
        }

        debug!(
            version = version.version.unwrap_or_default(),
            "Local docker scheduler successfully connected"
        );

        Ok(Self {
            client,
            secrets_path: config.secrets_path.clone(),
        })
    }

    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<bollard::auth::DockerCredentials>,
    ) -> Result<(), SchedulerError> {
        self.client
            .create_image(
                Some(bollard::image::CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                credentials,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| SchedulerError::NoSuchImage(format!("{:?}", e)))?;

        Ok(())
    }
}

/// Limits a prune to stopped build containers created at least `interval` seconds ago.
fn prune_filters(interval: u64) -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("label".to_string(), vec![NAMESPACE_LABEL.to_string()]),
        ("until".to_string(), vec![format!("{interval}s")]),
    ])
}

#[instrument(fields(origin = "scheduler::docker"))]
async fn prune_containers(client: bollard::Docker, interval: u64) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;
        debug!(interval = interval, "Started docker pruning");

        let options = bollard::container::PruneContainersOptions {
            filters: prune_filters(interval),
        };

        let result = match client.prune_containers(Some(options)).await {
            Ok(result) => result,
            Err(e) => {
                error!(err = ?e, "could not successfully prune containers");
                continue;
            }
        };

        info!(
            containers_deleted = ?result.containers_deleted,
            space_reclaimed = result.space_reclaimed,
            "Pruned containers"
        );
    }
}

#[async_trait]
impl super::Scheduler for Scheduler {
    async fn start_container(
        &self,
        request: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError> {
        let credentials =
            request
                .registry_auth
                .as_ref()
                .map(|ra| bollard::auth::DockerCredentials {
                    username: Some(ra.user.clone()),
                    password: Some(ra.pass.clone()),
                    ..Default::default()
                });

        if request.always_pull {
            self.pull_image(&request.image, credentials).await?;
        } else {
            let mut filters = HashMap::new();
            filters.insert("reference".to_string(), vec![request.image.clone()]);

            let images = self
                .client
                .list_images(Some(bollard::image::ListImagesOptions {
                    all: true,
                    filters,
                    ..Default::default()
                }))
                .await
                .map_err(|e| SchedulerError::Connection(e.to_string()))?;

            if images.is_empty() {
                self.pull_image(&request.image, credentials).await?;
            }
        }

        let mut labels = request.labels;
        labels.insert(NAMESPACE_LABEL.to_string(), request.namespace.clone());

        let binds: Vec<String> = request
            .secret_volumes
            .iter()
            .map(|volume| format_secret_bind(&self.secrets_path, &request.namespace, volume))
            .collect();

        let container_config = bollard::container::Config {
            image: Some(request.image.clone()),
            env: Some(
                request
                    .variables
                    .iter()
                    .map(|(key, value)| format_env_var(key, value))
                    .collect(),
            ),
            entrypoint: request.entrypoint,
            cmd: request.command,
            labels: Some(labels),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        // Names are unique keys; an existing container with this name fails the submission.
        let created_container = self
            .client
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: request.id.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 409, ..
                } => SchedulerError::Exists(request.id.clone()),
                e => SchedulerError::Unknown(e.to_string()),
            })?;

        self.client
            .start_container::<String>(&request.id, None)
            .await
            .map_err(|e| SchedulerError::Unknown(e.to_string()))?;

        Ok(StartContainerResponse {
            scheduler_id: Some(created_container.id),
        })
    }

    fn get_logs(&self, req: GetLogsRequest) -> LogStream {
        let logs_options = bollard::container::LogsOptions::<String> {
            follow: req.follow,
            stdout: true,
            stderr: true,
            tail: req
                .tail
                .map(|tail| tail.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let logs = self.client.logs(&req.id, Some(logs_options));

        let logs = logs
            .map_ok(|log| match log {
                bollard::container::LogOutput::StdOut { message } => Log::Stdout(message),
                bollard::container::LogOutput::StdErr { message } => Log::Stderr(message),
                _ => Log::Unknown,
            })
            .map_err(|e| SchedulerError::NoSuchContainer(e.to_string()));

        Box::pin(logs)
    }

    async fn get_state(&self, req: GetStateRequest) -> Result<GetStateResponse, SchedulerError> {
        let container_info = self
            .client
            .inspect_container(&req.id, None)
            .await
            .map_err(|e| SchedulerError::NoSuchContainer(e.to_string()))?;

        let Some(state) = container_info.state else {
            return Ok(GetStateResponse {
                exit_code: None,
                state: ContainerState::Unknown,
            });
        };

        let response = match state.status {
            Some(bollard::models::ContainerStateStatusEnum::CREATED)
            | Some(bollard::models::ContainerStateStatusEnum::RUNNING)
            | Some(bollard::models::ContainerStateStatusEnum::PAUSED)
            | Some(bollard::models::ContainerStateStatusEnum::RESTARTING) => GetStateResponse {
                exit_code: None,
                state: ContainerState::Running,
            },
            Some(bollard::models::ContainerStateStatusEnum::EXITED)
            | Some(bollard::models::ContainerStateStatusEnum::DEAD) => GetStateResponse {
                exit_code: state.exit_code,
                state: ContainerState::Exited,
            },
            _ => GetStateResponse {
                exit_code: None,
                state: ContainerState::Unknown,
            },
        };

        Ok(response)
    }
}

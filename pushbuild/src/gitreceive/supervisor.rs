use super::job::BuildJobSpec;
use crate::{conf, scheduler};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// How long we keep draining a followed log stream after the job has exited.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shortest pause between two state queries. A configured interval of zero is raised to this.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("could not submit build job '{job}'; {source}")]
    Submission {
        job: String,
        source: scheduler::SchedulerError,
    },

    #[error("build job '{job}' failed; {status}\n{logs}")]
    Runtime {
        job: String,
        status: String,
        logs: String,
    },

    #[error("could not query state of build job '{job}'; {source}\n{logs}")]
    Watch {
        job: String,
        source: scheduler::SchedulerError,
        logs: String,
    },

    #[error("build job '{job}' did not finish within {timeout:?}\n{logs}")]
    TimedOut {
        job: String,
        timeout: Duration,
        logs: String,
    },
}

/// Submits build jobs and watches them until they reach a terminal state.
///
/// Jobs are never retried and never cleaned up here; a retry is a new push and therefore a new job.
#[derive(Debug, Clone)]
pub struct BuildSupervisor {
    scheduler: Arc<dyn scheduler::Scheduler>,
    poll_interval: Duration,
    timeout: Duration,
    log_tail_lines: usize,
}

impl BuildSupervisor {
    pub fn new(
        scheduler: Arc<dyn scheduler::Scheduler>,
        poll_interval: Duration,
        timeout: Duration,
        log_tail_lines: usize,
    ) -> Self {
        Self {
            scheduler,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            timeout,
            log_tail_lines,
        }
    }

    pub fn from_config(scheduler: Arc<dyn scheduler::Scheduler>, config: &conf::Build) -> Self {
        Self::new(
            scheduler,
            Duration::from_secs(config.poll_interval),
            Duration::from_secs(config.timeout),
            config.log_tail_lines,
        )
    }

    /// Run the job to completion, streaming its output into `progress` as it goes.
    pub async fn run<W>(&self, spec: BuildJobSpec, progress: &mut W) -> Result<(), BuildError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let job = spec.name.clone();

        info!(job = %job, namespace = %spec.namespace, strategy = %spec.strategy, "Submitting build job");

        self.scheduler
            .start_container(spec.into())
            .await
            .map_err(|source| BuildError::Submission {
                job: job.clone(),
                source,
            })?;

        let mut logs = self.scheduler.get_logs(scheduler::GetLogsRequest {
            id: job.clone(),
            follow: true,
            tail: None,
        });
        let mut logs_open = true;

        let mut interval = tokio::time::interval(self.poll_interval);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    error!(job = %job, timeout = ?self.timeout, "Build job did not finish in time");
                    return Err(BuildError::TimedOut {
                        timeout: self.timeout,
                        logs: self.log_tail(&job).await,
                        job,
                    });
                }
                item = logs.next(), if logs_open => {
                    logs_open = forward_log(item, progress, &job).await;
                }
                _ = interval.tick() => {
                    let response = match self
                        .scheduler
                        .get_state(scheduler::GetStateRequest { id: job.clone() })
                        .await
                    {
                        Ok(response) => response,
                        Err(source) => {
                            error!(job = %job, error = %source, "Could not query the scheduler for the build job state");
                            return Err(BuildError::Watch {
                                source,
                                logs: self.log_tail(&job).await,
                                job,
                            });
                        }
                    };

                    match response.state {
                        scheduler::ContainerState::Running => {}
                        scheduler::ContainerState::Unknown => {
                            return Err(BuildError::Runtime {
                                status: "scheduler reported an unknown job state".into(),
                                logs: self.log_tail(&job).await,
                                job,
                            });
                        }
                        scheduler::ContainerState::Exited => {
                            // Let the followed stream catch up so the pusher sees the complete output.
                            if logs_open {
                                let drain = async {
                                    while forward_log(logs.next().await, progress, &job).await {}
                                };
                                if tokio::time::timeout(LOG_DRAIN_TIMEOUT, drain).await.is_err() {
                                    debug!(job = %job, "Gave up draining log stream of exited build job");
                                }
                            }

                            return match response.exit_code {
                                Some(0) => {
                                    info!(job = %job, "Build job completed successfully");
                                    Ok(())
                                }
                                code => {
                                    let status = match code {
                                        Some(code) => format!("exited with code {code}"),
                                        None => "exited without an exit code".to_string(),
                                    };
                                    error!(job = %job, status = %status, "Build job failed");
                                    Err(BuildError::Runtime {
                                        status,
                                        logs: self.log_tail(&job).await,
                                        job,
                                    })
                                }
                            };
                        }
                    }
                }
            }
        }
    }

    /// Returns the last `log_tail_lines` lines the job has written.
    async fn log_tail(&self, job: &str) -> String {
        let mut logs = self.scheduler.get_logs(scheduler::GetLogsRequest {
            id: job.to_string(),
            follow: false,
            tail: Some(self.log_tail_lines),
        });

        let mut output = Vec::new();
        while let Some(item) = logs.next().await {
            match item {
                Ok(scheduler::Log::Stdout(bytes)) | Ok(scheduler::Log::Stderr(bytes)) => {
                    output.extend_from_slice(&bytes)
                }
                Ok(scheduler::Log::Unknown) => {}
                Err(e) => {
                    warn!(job = %job, error = %e, "Could not fetch logs for build job");
                    break;
                }
            }
        }

        let output = String::from_utf8_lossy(&output);
        let lines: Vec<&str> = output.lines().collect();
        lines[lines.len().saturating_sub(self.log_tail_lines)..].join("\n")
    }
}

/// Writes one log entry to the pusher. Returns false once the stream is finished.
async fn forward_log<W>(
    item: Option<Result<scheduler::Log, scheduler::SchedulerError>>,
    progress: &mut W,
    job: &str,
) -> bool
where
    W: AsyncWrite + Unpin + Send,
{
    let bytes = match item {
        Some(Ok(scheduler::Log::Stdout(bytes))) | Some(Ok(scheduler::Log::Stderr(bytes))) => bytes,
        Some(Ok(scheduler::Log::Unknown)) => return true,
        Some(Err(e)) => {
            debug!(job = %job, error = %e, "Log stream for build job ended with an error");
            return false;
        }
        None => return false,
    };

    // A pusher that went away must not fail the build; the job keeps running regardless.
    if let Err(e) = progress.write_all(&bytes).await {
        warn!(job = %job, error = %e, "Could not relay build output to pusher");
    }

    true
}

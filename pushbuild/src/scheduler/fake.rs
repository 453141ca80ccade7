//! An in-memory scheduler that plays back scripted container states.

use super::{
    ContainerState, GetLogsRequest, GetStateRequest, GetStateResponse, Log, LogStream,
    Scheduler, SchedulerError, StartContainerRequest, StartContainerResponse,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct FakeScheduler {
    /// States returned by successive `get_state` calls. The last one repeats forever.
    states: Mutex<VecDeque<GetStateResponse>>,
    log_lines: Vec<String>,
    reject_start: Option<SchedulerError>,
    pub started: Mutex<Vec<StartContainerRequest>>,
}

impl FakeScheduler {
    pub fn new(states: Vec<GetStateResponse>, log_lines: Vec<&str>) -> Self {
        Self {
            states: Mutex::new(states.into()),
            log_lines: log_lines.into_iter().map(String::from).collect(),
            ..Default::default()
        }
    }

    /// A job that runs for one poll and then exits with `code`.
    pub fn exits_with(code: i64, log_lines: Vec<&str>) -> Self {
        Self::new(
            vec![
                GetStateResponse {
                    exit_code: None,
                    state: ContainerState::Running,
                },
                GetStateResponse {
                    exit_code: Some(code),
                    state: ContainerState::Exited,
                },
            ],
            log_lines,
        )
    }

    pub fn rejecting(err: SchedulerError) -> Self {
        Self {
            reject_start: Some(err),
            ..Default::default()
        }
    }

    pub fn started_ids(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.id.clone())
            .collect()
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn start_container(
        &self,
        req: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError> {
        if let Some(err) = &self.reject_start {
            return Err(err.clone());
        }

        let mut started = self.started.lock().unwrap();
        if started.iter().any(|existing| existing.id == req.id) {
            return Err(SchedulerError::Exists(req.id));
        }
        started.push(req);

        Ok(StartContainerResponse { scheduler_id: None })
    }

    async fn get_state(&self, _req: GetStateRequest) -> Result<GetStateResponse, SchedulerError> {
        let mut states = self.states.lock().unwrap();

        if states.len() > 1 {
            return Ok(states.pop_front().unwrap());
        }

        states
            .front()
            .cloned()
            .ok_or_else(|| SchedulerError::NoSuchContainer("no scripted state".into()))
    }

    fn get_logs(&self, req: GetLogsRequest) -> LogStream {
        let skip = req
            .tail
            .map(|tail| self.log_lines.len().saturating_sub(tail))
            .unwrap_or(0);

        let logs: Vec<Result<Log, SchedulerError>> = self
            .log_lines
            .iter()
            .skip(skip)
            .map(|line| Ok(Log::Stdout(bytes::Bytes::from(format!("{line}\n")))))
            .collect();

        Box::pin(futures::stream::iter(logs))
    }
}

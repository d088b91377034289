//! Wire types shared by both ends and the worker-side gateway to the
//! coordinator.

use std::time::Duration;

use thiserror::Error;
use tonic::transport::{Channel, Endpoint};

use mr_types::{
    coordinator_client::CoordinatorClient, AskForTaskRequest, PingRequest, RegisterRequest,
    ReportFinishedTaskRequest, RpcResult, StatusCode, Task,
};

pub mod mr_types {
    include!("../../proto/mr.rs");
}

impl RpcResult {
    pub fn success() -> Self {
        RpcResult::with(StatusCode::Success, "")
    }

    pub fn with(code: StatusCode, message: impl Into<String>) -> Self {
        RpcResult {
            code: code as i32,
            message: message.into(),
        }
    }

    /// Unknown codes from a newer peer are read as `Error`.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_i32(self.code).unwrap_or(StatusCode::Error)
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    /// The request never produced a reply: connect refused, connection
    /// dropped, deadline exceeded, or a gRPC-level failure.
    #[error("call did not complete: {0}")]
    Transport(String),
    /// The coordinator answered with a non-success status.
    #[error("coordinator replied {code:?}: {message}")]
    Rejected { code: StatusCode, message: String },
}

impl RpcError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

impl From<tonic::transport::Error> for RpcError {
    fn from(e: tonic::transport::Error) -> Self {
        RpcError::Transport(e.to_string())
    }
}

impl From<tonic::Status> for RpcError {
    fn from(s: tonic::Status) -> Self {
        RpcError::Transport(format!("{:?}: {}", s.code(), s.message()))
    }
}

/// What the coordinator handed back for an `AskForTask`.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Task(Task),
    NoTaskYet,
    JobDone,
}

fn check(result: Option<RpcResult>) -> Result<(), RpcError> {
    let result = result.ok_or_else(|| RpcError::Rejected {
        code: StatusCode::Error,
        message: "reply carried no result".to_string(),
    })?;
    match result.status() {
        StatusCode::Success => Ok(()),
        code => Err(RpcError::Rejected {
            code,
            message: result.message,
        }),
    }
}

/// Opens one connection per call to the coordinator. No retries happen
/// here; callers decide what a failure means.
#[derive(Debug, Clone)]
pub struct CoordinatorGateway {
    endpoint: String,
    timeout: Duration,
}

impl CoordinatorGateway {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        CoordinatorGateway {
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<CoordinatorClient<Channel>, RpcError> {
        let channel = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| RpcError::Transport(format!("bad endpoint {}: {}", self.endpoint, e)))?
            .timeout(self.timeout)
            .connect()
            .await?;
        Ok(CoordinatorClient::new(channel))
    }

    pub async fn register(&self) -> Result<u64, RpcError> {
        let mut client = self.connect().await?;
        let reply = client.register(RegisterRequest {}).await?.into_inner();
        check(reply.result)?;
        Ok(reply.worker_id)
    }

    pub async fn ping(&self, worker_id: u64) -> Result<(), RpcError> {
        let mut client = self.connect().await?;
        let reply = client.ping(PingRequest { worker_id }).await?.into_inner();
        check(reply.result)
    }

    pub async fn ask_for_task(&self, worker_id: u64) -> Result<Assignment, RpcError> {
        let mut client = self.connect().await?;
        let reply = client
            .ask_for_task(AskForTaskRequest { worker_id })
            .await?
            .into_inner();
        let result = reply.result.unwrap_or_else(|| {
            RpcResult::with(StatusCode::Error, "reply carried no result")
        });
        match result.status() {
            StatusCode::Success => match reply.task {
                Some(task) => Ok(Assignment::Task(task)),
                None => Err(RpcError::Rejected {
                    code: StatusCode::Error,
                    message: "success reply without a task".to_string(),
                }),
            },
            StatusCode::NoTaskYet => Ok(Assignment::NoTaskYet),
            StatusCode::JobDone => Ok(Assignment::JobDone),
            code => Err(RpcError::Rejected {
                code,
                message: result.message,
            }),
        }
    }

    pub async fn report_finished_task(&self, worker_id: u64, task_id: u32) -> Result<(), RpcError> {
        let mut client = self.connect().await?;
        let reply = client
            .report_finished_task(ReportFinishedTaskRequest { worker_id, task_id })
            .await?
            .into_inner();
        check(reply.result)
    }
}

//! gRPC surface: translates the four Scheduler methods onto the executor and
//! the RBAC gates.
//!
//! Every handler first resolves the caller's identity from the peer
//! certificate, then runs the gate matching the request's shape. Launch
//! failures travel inside the Start response payload; only authentication,
//! authorization and lookup failures become RPC statuses. A child process
//! failing at runtime is never an RPC error — callers observe it via Get.

use std::io::Read;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::config::CHANNEL_BUFFER_SIZE;
use crate::executor::{Executor, ExecutorError, JobConfig};
use crate::pb::scheduler_server::Scheduler;
use crate::pb::{
    GetRequest, GetResponse, OutputChunk, OutputRequest, StartRequest, StartResponse, StopRequest,
    StopResponse,
};
use crate::rbac::{peer_identity, Rbac};

/// Output is streamed to clients in chunks of this size.
const STREAM_CHUNK_SIZE: usize = 1024;

#[derive(Clone)]
pub struct SchedulerService {
    executor: Arc<Executor>,
    rbac: Arc<Rbac>,
}

impl SchedulerService {
    pub fn new(executor: Arc<Executor>, rbac: Arc<Rbac>) -> Self {
        SchedulerService { executor, rbac }
    }

    async fn handle_start(&self, user: &str, request: StartRequest) -> Result<StartResponse, Status> {
        self.rbac.authorize_command(user, &request)?;

        let limits = request.limits.unwrap_or_default();
        let config = JobConfig {
            cmd: request.cmd,
            args: request.args,
            cpu_percent: limits.cpu_percent,
            memory_mb: limits.memory_mb,
            read_bps: limits.read_bps,
            write_bps: limits.write_bps,
            ..JobConfig::default()
        };

        match self.executor.start(config).await {
            Ok(pid) => {
                // ownership only for launches that actually produced a child
                self.rbac.record_ownership(user, pid);
                tracing::info!(user, pid, "job started");
                Ok(StartResponse { pid, error: None })
            }
            Err(err) => {
                tracing::warn!(user, error = %err, "command execution failed");
                Ok(StartResponse {
                    pid: 0,
                    error: Some(err.to_string()),
                })
            }
        }
    }

    async fn handle_get(&self, user: &str, request: GetRequest) -> Result<GetResponse, Status> {
        self.rbac.authorize_access(user, &request)?;

        match self.executor.get(request.pid).await {
            Some(status) => Ok(GetResponse {
                found: true,
                pid: request.pid,
                status: status.state.to_string(),
            }),
            None => Ok(GetResponse {
                found: false,
                pid: 0,
                status: String::new(),
            }),
        }
    }

    async fn handle_stdout(
        &self,
        user: &str,
        request: OutputRequest,
    ) -> Result<ReceiverStream<Result<OutputChunk, Status>>, Status> {
        // the gate runs on the first (and only) inbound message, before any
        // byte is streamed
        self.rbac.authorize_access(user, &request)?;

        let pid = request.pid;
        let mut reader = self.executor.stdout(pid).await.map_err(|err| match err {
            ExecutorError::JobNotFound(_) => Status::not_found(err.to_string()),
            other => Status::internal(other.to_string()),
        })?;

        let (tx, rx) = tokio::sync::mpsc::channel(CHANNEL_BUFFER_SIZE);
        let _ = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; STREAM_CHUNK_SIZE];
            loop {
                // a cancelled client drops the receiver; stop following
                if tx.is_closed() {
                    break;
                }
                match reader.read(&mut buf) {
                    Ok(0) => {
                        if reader.finished() {
                            break;
                        }
                    }
                    Ok(n) => {
                        let chunk = OutputChunk {
                            data: buf[..n].to_vec(),
                        };
                        if tx.blocking_send(Ok(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(pid, error = %err, "error reading job output");
                        let _ = tx.blocking_send(Err(Status::internal(err.to_string())));
                        break;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn handle_stop(&self, user: &str, request: StopRequest) -> Result<StopResponse, Status> {
        self.rbac.authorize_access(user, &request)?;
        self.executor.stop_process(request.pid).await;
        Ok(StopResponse {})
    }
}

#[tonic::async_trait]
impl Scheduler for SchedulerService {
    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        let user = peer_identity(&request)?;
        self.handle_start(&user, request.into_inner())
            .await
            .map(Response::new)
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let user = peer_identity(&request)?;
        self.handle_get(&user, request.into_inner())
            .await
            .map(Response::new)
    }

    type StdoutStream = ReceiverStream<Result<OutputChunk, Status>>;

    async fn stdout(
        &self,
        request: Request<OutputRequest>,
    ) -> Result<Response<Self::StdoutStream>, Status> {
        let user = peer_identity(&request)?;
        self.handle_stdout(&user, request.into_inner())
            .await
            .map(Response::new)
    }

    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        let user = peer_identity(&request)?;
        self.handle_stop(&user, request.into_inner())
            .await
            .map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SchedulerService {
        SchedulerService::new(Arc::new(Executor::new().unwrap()), Arc::new(Rbac::new()))
    }

    fn start_request(cmd: &str) -> StartRequest {
        StartRequest {
            cmd: cmd.to_string(),
            args: vec![],
            limits: None,
        }
    }

    #[tokio::test]
    async fn denied_commands_never_reach_the_executor() {
        let service = service();
        let err = service
            .handle_start("user2", start_request("rm"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
        assert!(service.executor.list().await.is_empty());
    }

    #[tokio::test]
    async fn launch_failures_travel_in_the_payload() {
        let service = service();
        let response = service
            .handle_start("user1", start_request("bashh"))
            .await
            .unwrap();
        assert_eq!(response.pid, 0);
        let error = response.error.unwrap();
        assert!(error.contains("not found"));
    }

    #[tokio::test]
    async fn get_reports_unknown_pids() {
        let service = service();
        let response = service
            .handle_get("user1", GetRequest { pid: 99 })
            .await
            .unwrap();
        assert!(!response.found);
        assert_eq!(response.pid, 0);
    }

    #[tokio::test]
    async fn stdout_requires_ownership_before_lookup() {
        let service = service();
        let err = service
            .handle_stdout("user3", OutputRequest { pid: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn stdout_reports_unknown_pids_to_admins() {
        let service = service();
        let err = service
            .handle_stdout("user1", OutputRequest { pid: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn stop_is_best_effort() {
        let service = service();
        // unknown pid: no error
        let _ = service
            .handle_stop("user1", StopRequest { pid: 5 })
            .await
            .unwrap();
    }
}

//! Streaming task invoker: one invocation of one real task over the
//! worker RPC, relaying output frames to the run surface and judging the
//! outcome against the task's expectations.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::Code;

use crate::catalog::TaskDescriptor;
use crate::error::{CronmeshError, Result};
use crate::proto::worker_client::WorkerClient;
use crate::proto::TaskReq;
use crate::route::RouteConn;
use crate::schedule::model::{FirstFailure, TaskPhase, TaskResult, TaskStatus};
use crate::schedule::runner::RunContext;
use crate::schedule::Scheduler;
use crate::store::keys;
use crate::worker::executor::{parse_exit_code, DEFAULT_EXIT_CODE};

impl Scheduler {
    /// Run one real task of the current run. Every outcome is written to
    /// the run surface; the returned error is the judgement error, which
    /// the phase group uses to cancel siblings.
    pub(crate) async fn run_real_task(
        self: Arc<Self>,
        ctx: Arc<RunContext>,
        cancel: CancellationToken,
        real_id: String,
        phase: TaskPhase,
    ) -> Result<()> {
        let master_id = ctx.master_id.clone();
        self.mark_status(&master_id, phase, &real_id, TaskStatus::Run)
            .await;

        let mut exit_code = DEFAULT_EXIT_CODE;
        let mut run_host = String::new();
        let mut expect_buf: Vec<u8> = Vec::new();
        let mut upstream: Option<CronmeshError> = None;
        let mut task_name = real_id.clone();

        let desc = match self.fetch_task(&real_id).await {
            Ok(desc) => {
                task_name = desc.name.clone();
                Some(desc)
            }
            Err(e) => {
                self.append_log_line(
                    &master_id,
                    phase,
                    &real_id,
                    format!("fetch {phase} task {real_id} from catalog failed: {e}"),
                )
                .await;
                upstream = Some(e);
                None
            }
        };

        if let Some(desc) = &desc {
            match self.entry(&real_id).await {
                Some(entry) => loop {
                    let conn = match entry.chooser.choose().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            self.append_log_line(
                                &master_id,
                                phase,
                                &real_id,
                                format!(
                                    "no reachable worker in host group {}: {e}",
                                    desc.host_group_id
                                ),
                            )
                            .await;
                            upstream = Some(e);
                            break;
                        }
                    };
                    run_host = conn.target.clone();
                    self.append_log_line(
                        &master_id,
                        phase,
                        &real_id,
                        format!(
                            "start run task {}[{}] on host {}",
                            desc.name, desc.id, conn.target
                        ),
                    )
                    .await;

                    match self
                        .invoke_stream(&ctx, &cancel, desc, &real_id, phase, &conn, &mut expect_buf)
                        .await
                    {
                        Ok(code) => {
                            exit_code = code;
                            upstream = None;
                            break;
                        }
                        Err(CronmeshError::WorkerUnavailable(msg)) => {
                            // worker went down mid-run; pick another host
                            // and run the task again
                            tracing::error!(
                                task_id = %real_id,
                                host = %conn.target,
                                error = %msg,
                                "worker host is down, rerunning task"
                            );
                            self.append_log_line(
                                &master_id,
                                phase,
                                &real_id,
                                format!(
                                    "worker host {} is down, task {} will run again",
                                    conn.target, desc.name
                                ),
                            )
                            .await;
                            continue;
                        }
                        Err(e) => {
                            self.append_log_line(
                                &master_id,
                                phase,
                                &real_id,
                                format!("task {}[{}] run failed: {e}", desc.name, real_id),
                            )
                            .await;
                            upstream = Some(e);
                            break;
                        }
                    }
                },
                None => {
                    self.append_log_line(
                        &master_id,
                        phase,
                        &real_id,
                        format!("task {real_id} is not registered in the schedule"),
                    )
                    .await;
                    upstream = Some(CronmeshError::TaskNotFound(real_id.clone()));
                }
            }
        }

        let result = TaskResult {
            task_id: real_id.clone(),
            task_name: task_name.clone(),
            run_host,
            exit_code,
            phase,
            status: String::new(),
            log_data: String::new(),
        };
        self.store_result(&master_id, phase, &real_id, &result).await;

        // judgement and the first-failure record are serialised per run
        let mut first_failure = ctx.first_failure.lock().await;

        let judgement: Result<()> = match (upstream, &desc) {
            (Some(e), _) => Err(e),
            (None, Some(desc)) => {
                if desc.expect_code != exit_code {
                    Err(CronmeshError::TaskFailed(format!(
                        "{phase} task {real_id}[{}] exit code is {exit_code}, want {}",
                        desc.name, desc.expect_code
                    )))
                } else if !desc.expect_content.is_empty()
                    && !String::from_utf8_lossy(&expect_buf).contains(&desc.expect_content)
                {
                    Err(CronmeshError::TaskFailed(format!(
                        "{phase} task {real_id}[{}] output does not contain expected content: {}",
                        desc.name, desc.expect_content
                    )))
                } else {
                    Ok(())
                }
            }
            (None, None) => Err(CronmeshError::Internal(
                "task descriptor missing after successful run".to_string(),
            )),
        };

        match judgement {
            Ok(()) => {
                tracing::debug!(task_id = %real_id, name = %task_name, "task run success");
                self.mark_status(&master_id, phase, &real_id, TaskStatus::Finish)
                    .await;
                Ok(())
            }
            Err(e) => {
                if cancel.is_cancelled() || matches!(e, CronmeshError::Canceled) {
                    self.append_log_line(
                        &master_id,
                        phase,
                        &real_id,
                        format!("task {task_name}[{real_id}] is canceled"),
                    )
                    .await;
                    self.mark_status(&master_id, phase, &real_id, TaskStatus::Cancel)
                        .await;
                    return Ok(());
                }
                tracing::error!(task_id = %real_id, name = %task_name, error = %e, "task run failed");
                if first_failure.is_none() {
                    *first_failure = Some(FirstFailure {
                        phase,
                        task_id: real_id.clone(),
                        task_name: task_name.clone(),
                        exit_code,
                        message: e.to_string(),
                    });
                }
                self.mark_status(&master_id, phase, &real_id, TaskStatus::Fail)
                    .await;
                Err(e)
            }
        }
    }

    /// Open the RPC stream and relay frames until EOF, cancellation or
    /// the per-task deadline. Returns the worker exit code on EOF.
    #[allow(clippy::too_many_arguments)]
    async fn invoke_stream(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
        desc: &TaskDescriptor,
        real_id: &str,
        phase: TaskPhase,
        conn: &RouteConn,
        expect_buf: &mut Vec<u8>,
    ) -> Result<i32> {
        let request = TaskReq {
            task_id: real_id.to_string(),
            kind: desc.kind.code(),
            payload: desc.payload.clone(),
        };
        let deadline =
            (desc.timeout_sec > 0).then(|| Instant::now() + Duration::from_secs(desc.timeout_sec));

        let mut client = WorkerClient::new(conn.channel.clone());
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CronmeshError::Canceled),
            _ = sleep_until_deadline(deadline) => return Err(CronmeshError::RunTimeout(desc.timeout_sec)),
            opened = client.run_task(tonic::Request::new(request)) => opened,
        };
        let mut stream = match opened {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(map_rpc_status(status, desc.timeout_sec)),
        };

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CronmeshError::Canceled),
                _ = sleep_until_deadline(deadline) => return Err(CronmeshError::RunTimeout(desc.timeout_sec)),
                frame = stream.message() => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    self.append_log(&ctx.master_id, phase, real_id, &frame.resp)
                        .await;
                    expect_buf.extend_from_slice(&frame.resp);
                }
                Ok(None) => return self.read_exit_code(&ctx.master_id, phase, real_id).await,
                Err(status) => return Err(map_rpc_status(status, desc.timeout_sec)),
            }
        }
    }

    /// The worker encodes its exit code in the last 5 bytes of the final
    /// frame; read it back from the log list.
    async fn read_exit_code(&self, master_id: &str, phase: TaskPhase, real_id: &str) -> Result<i32> {
        let last = self
            .store
            .lindex(&keys::phase_log(master_id, phase.code(), real_id), -1)
            .await?;
        let Some(last) = last else {
            return Err(CronmeshError::TaskFailed(format!(
                "task {real_id} stream ended without any output frame"
            )));
        };
        match parse_exit_code(&last) {
            Some(code) => Ok(code),
            None => Err(CronmeshError::TaskFailed(format!(
                "task {real_id} final frame carries no exit code"
            ))),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn map_rpc_status(status: tonic::Status, timeout_sec: u64) -> CronmeshError {
    match status.code() {
        Code::Unavailable => CronmeshError::WorkerUnavailable(status.message().to_string()),
        Code::Cancelled => CronmeshError::Canceled,
        Code::DeadlineExceeded => CronmeshError::RunTimeout(timeout_sec),
        _ => CronmeshError::Grpc(status),
    }
}

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::catalog::TaskKind;
use crate::proto::worker_server::Worker;
use crate::proto::{TaskFrame, TaskReq};
use crate::worker::executor;

const STREAM_BUFFER: usize = 32;

/// Streaming worker service: executes one task per `RunTask` call and
/// streams its output frames back until the exit-code frame.
#[derive(Debug, Clone, Default)]
pub struct WorkerService;

#[tonic::async_trait]
impl Worker for WorkerService {
    type RunTaskStream = ReceiverStream<Result<TaskFrame, Status>>;

    async fn run_task(
        &self,
        request: Request<TaskReq>,
    ) -> Result<Response<Self::RunTaskStream>, Status> {
        let req = request.into_inner();
        let kind = TaskKind::from_code(req.kind)
            .ok_or_else(|| Status::invalid_argument(format!("unsupported task kind {}", req.kind)))?;
        tracing::info!(task_id = %req.task_id, kind = %kind, "worker received task");

        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(STREAM_BUFFER);
        let (resp_tx, resp_rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(executor::execute(kind, req.payload, frame_tx));
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if resp_tx.send(Ok(TaskFrame { resp: frame })).await.is_err() {
                    // controller hung up; dropping frame_rx tells the
                    // executor to stop
                    return;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(resp_rx)))
    }
}

//! Shared fixtures for integration tests: an in-memory store and catalog,
//! real worker gRPC servers, and descriptor builders.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use cronmesh::catalog::{LogAlarm, MemoryCatalog, MemoryHistory, TaskDescriptor, TaskKind, WorkerHost};
use cronmesh::proto::worker_server::{Worker, WorkerServer};
use cronmesh::proto::{TaskFrame, TaskReq};
use cronmesh::schedule::Scheduler;
use cronmesh::store::MemoryStore;
use cronmesh::worker;

/// A scheduler wired to fresh in-memory collaborators.
pub struct TestBed {
    pub store: Arc<MemoryStore>,
    pub catalog: Arc<MemoryCatalog>,
    pub history: Arc<MemoryHistory>,
    pub scheduler: Arc<Scheduler>,
}

pub fn testbed() -> TestBed {
    let store = Arc::new(MemoryStore::new());
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.set_installed(true);
    let history = Arc::new(MemoryHistory::new());
    let scheduler = Scheduler::new(
        store.clone(),
        catalog.clone(),
        history.clone(),
        Arc::new(LogAlarm),
    );
    TestBed {
        store,
        catalog,
        history,
        scheduler,
    }
}

/// Handle to a worker gRPC server running in-process.
pub struct TestWorker {
    pub addr: String,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

/// Start a real worker service on the given port.
pub async fn spawn_worker(port: u16) -> TestWorker {
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = worker::serve(addr, server_shutdown).await {
            tracing::error!(error = %e, "test worker server failed");
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    TestWorker {
        addr: format!("127.0.0.1:{port}"),
        shutdown,
        handle,
    }
}

/// Worker stub whose `RunTask` always reports the endpoint unavailable,
/// as a draining or dying worker would.
struct UnavailableWorker;

#[tonic::async_trait]
impl Worker for UnavailableWorker {
    type RunTaskStream = ReceiverStream<Result<TaskFrame, Status>>;

    async fn run_task(
        &self,
        _request: Request<TaskReq>,
    ) -> Result<Response<Self::RunTaskStream>, Status> {
        Err(Status::unavailable("worker is shutting down"))
    }
}

/// Start a worker that accepts connections but fails every RPC with
/// `Unavailable`.
pub async fn spawn_unavailable_worker(port: u16) -> TestWorker {
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(WorkerServer::new(UnavailableWorker))
            .serve_with_shutdown(addr, server_shutdown.cancelled())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "unavailable worker server failed");
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    TestWorker {
        addr: format!("127.0.0.1:{port}"),
        shutdown,
        handle,
    }
}

/// Collect every frame of one `execute` call.
pub async fn collect_frames(kind: TaskKind, payload: Vec<u8>) -> Vec<Vec<u8>> {
    let (tx, mut rx) = mpsc::channel(32);
    tokio::spawn(cronmesh::worker::executor::execute(kind, payload, tx));
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    frames
}

/// A shell task descriptor with no dependencies, fired manually in tests
/// (the cron expression fires once a year).
pub fn shell_descriptor(id: &str, host_group: &str, command: &str) -> TaskDescriptor {
    TaskDescriptor {
        id: id.to_string(),
        name: format!("{id}-task"),
        cron_expr: "0 0 0 1 1 *".to_string(),
        parents: Vec::new(),
        children: Vec::new(),
        parent_parallel: false,
        child_parallel: false,
        host_group_id: host_group.to_string(),
        route_policy: Default::default(),
        kind: TaskKind::Shell,
        payload: serde_json::to_vec(&serde_json::json!({ "command": command })).unwrap(),
        timeout_sec: 0,
        expect_code: 0,
        expect_content: String::new(),
        enabled: true,
    }
}

pub fn host(addr: &str) -> WorkerHost {
    WorkerHost {
        addr: addr.to_string(),
        weight: 100,
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}

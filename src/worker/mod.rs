//! Worker-side execution engine.
//!
//! A worker process hosts the streaming `Worker` gRPC service; for each
//! `RunTask` call it interprets the payload per task kind, streams output
//! frames back to the controller, and terminates the stream with the
//! exit-code frame every conforming worker must emit.

pub mod executor;
pub mod service;

pub use service::WorkerService;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::proto::worker_server::WorkerServer;

/// Serve the worker gRPC service until the shutdown token fires.
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    tracing::info!(addr = %addr, "starting worker gRPC server");
    tonic::transport::Server::builder()
        .add_service(WorkerServer::new(WorkerService::default()))
        .serve_with_shutdown(addr, shutdown.cancelled())
        .await?;
    Ok(())
}

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cronmesh::catalog::{LogAlarm, MemoryCatalog, MemoryHistory};
use cronmesh::dashboard::{run_dashboard, DashboardState};
use cronmesh::schedule::Scheduler;
use cronmesh::shutdown::install_shutdown_handler;
use cronmesh::store::MemoryStore;
use cronmesh::worker;

#[derive(Parser, Debug)]
#[command(name = "cronmesh")]
#[command(about = "A distributed cron scheduler with dependency chaining")]
struct Args {
    /// Port for the worker gRPC service
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Port for the read-only status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Run the worker service only, without the schedule control plane
    #[arg(long)]
    worker_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let shutdown = install_shutdown_handler();
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    tracing::info!(
        port = args.port,
        dashboard_port = ?args.dashboard_port,
        worker_only = args.worker_only,
        "starting cronmesh node"
    );

    if !args.worker_only {
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.set_installed(true);
        let scheduler = Scheduler::new(
            store,
            catalog,
            Arc::new(MemoryHistory::new()),
            Arc::new(LogAlarm),
        );
        scheduler.boot().await?;

        if let Some(port) = args.dashboard_port {
            let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
            let state = DashboardState {
                scheduler: scheduler.clone(),
            };
            tokio::spawn(run_dashboard(addr, state));
        }
    }

    worker::serve(listen_addr, shutdown).await?;
    Ok(())
}

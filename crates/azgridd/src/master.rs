//! Master mode — supervises a cluster of Azure workers.
//!
//! In this mode, the daemon:
//! 1. Builds a session from the `AZURE_TOKEN` environment variable
//! 2. Starts the cluster manager (listener, acceptor, registrar)
//! 3. Tracks registered workers until shutdown
//! 4. On shutdown, drains every in-flight worker removal

use std::sync::{Arc, Mutex};
use std::time::Duration;

use azgrid_azure::EnvSession;
use azgrid_manager::{ClusterManager, DistributedRuntime, ManagerOptions, WorkerConfig};
use rand::Rng;
use tokio::net::TcpStream;
use tracing::info;

/// Seconds a provisioning or deletion poll may run before giving up,
/// absent an embedding runtime with its own budget.
const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 600;

/// Stands in for an embedding compute framework: keeps registered
/// workers alive and visible for supervision.
struct SupervisedRuntime {
    workers: Mutex<Vec<(TcpStream, WorkerConfig)>>,
}

impl SupervisedRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            workers: Mutex::new(Vec::new()),
        })
    }
}

impl DistributedRuntime for SupervisedRuntime {
    fn register(&self, stream: TcpStream, config: WorkerConfig) {
        let mut workers = self.workers.lock().expect("worker lock poisoned");
        workers.push((stream, config));
        info!(total = workers.len(), "worker attached");
    }

    fn send_exit(&self, config: &WorkerConfig) {
        let mut workers = self.workers.lock().expect("worker lock poisoned");
        workers.retain(|(_, w)| w.bind_addr != config.bind_addr);
    }

    fn worker_timeout(&self) -> Duration {
        let secs = std::env::var("AZGRID_WORKER_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_WORKER_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }
}

pub async fn run_master(cookie: Option<String>, nretry: u32, verbose: bool) -> anyhow::Result<()> {
    info!("azgridd starting in master mode");

    let cookie = cookie.unwrap_or_else(random_cookie);
    let options = ManagerOptions {
        cookie,
        nretry,
        verbose,
        ..Default::default()
    };

    let runtime = SupervisedRuntime::new();
    let session = Arc::new(EnvSession::default());
    let manager = ClusterManager::init(runtime, session, options).await?;
    info!(addr = %manager.listen_addr(), "cluster manager ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received, draining pending removals");
    manager.shutdown().await;

    info!("master stopped");
    Ok(())
}

fn random_cookie() -> String {
    let mut rng = rand::rng();
    (0..azgrid_core::HDR_COOKIE_LEN)
        .map(|_| {
            let idx = rng.random_range(0..26u8);
            (b'a' + idx) as char
        })
        .collect()
}

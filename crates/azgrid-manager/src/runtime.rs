//! Seam to the distributed-compute runtime.
//!
//! Worker-process bootstrapping, message serialization, and remote
//! calls belong to the compute framework embedding this manager. The
//! manager only authenticates sockets and reports them here.

use std::time::Duration;

use azgrid_core::WorkerUserdata;
use tokio::net::TcpStream;

/// Everything the runtime needs to drive one registered worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Address the worker bound for peer connections.
    pub bind_addr: String,
    /// Worker processes on this instance (ppi).
    pub count: u32,
    /// Runtime executable and flags used to spawn further processes.
    pub exename: String,
    pub exeflags: String,
    /// Azure placement; absent for secondary processes on a shared VM.
    pub userdata: Option<WorkerUserdata>,
}

/// The compute framework the manager feeds workers into.
pub trait DistributedRuntime: Send + Sync + 'static {
    /// Take ownership of an authenticated worker socket.
    fn register(&self, stream: TcpStream, config: WorkerConfig);

    /// Fire-and-forget exit request to a worker being removed.
    fn send_exit(&self, config: &WorkerConfig);

    /// The runtime's worker timeout; bounds provisioning/deletion polls.
    fn worker_timeout(&self) -> Duration;
}

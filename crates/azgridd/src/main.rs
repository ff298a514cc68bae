//! azgridd — the AzGrid daemon.
//!
//! Single binary with two modes:
//!
//! - **master** — runs the cluster manager: listens for inbound worker
//!   registrations and supervises scale-set lifecycle
//! - **detached-server** — runs on a provisioned VM, serving the
//!   detached-job HTTP API on port 8081
//!
//! # Usage
//!
//! ```text
//! azgridd master --cookie <secret>
//! azgridd detached-server --bind 0.0.0.0:8081 --user azureuser
//! ```

mod detached_server;
mod master;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "azgridd", about = "AzGrid daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the cluster master: accept and register inbound workers.
    Master {
        /// Shared secret workers present on their handshake. Generated
        /// randomly when omitted.
        #[arg(long)]
        cookie: Option<String>,

        /// Retry budget for Azure requests.
        #[arg(long, default_value = "10")]
        nretry: u32,

        /// Log every Azure request.
        #[arg(long)]
        verbose: bool,
    },

    /// Run the detached-job HTTP service (on a provisioned VM).
    DetachedServer {
        /// Listen address.
        #[arg(long, default_value = "0.0.0.0:8081")]
        bind: String,

        /// Unix user whose home holds the job files.
        #[arg(long, default_value = "azureuser")]
        user: String,

        /// Working directory for job files (default: the user's home).
        #[arg(long)]
        workdir: Option<String>,

        /// Interpreter for submitted code.
        #[arg(long, default_value = "julia")]
        exename: String,

        /// Flags passed to the interpreter before the code file.
        #[arg(long, default_value = "")]
        exeflags: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Master {
            cookie,
            nretry,
            verbose,
        } => master::run_master(cookie, nretry, verbose).await,
        Command::DetachedServer {
            bind,
            user,
            workdir,
            exename,
            exeflags,
        } => detached_server::run_detached_server(bind, user, workdir, exename, exeflags).await,
    }
}

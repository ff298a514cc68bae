//! Detached-server mode — runs on the provisioned VM.
//!
//! Discovers its own identity through instance metadata (falling back
//! to hostname-only when metadata is unreachable, e.g. local testing),
//! serves the job API, and handles self-termination requests from
//! non-persistent jobs by deleting its own VM through the Azure API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use azgrid_azure::{AzureClient, EnvSession, InstanceMetadata};
use azgrid_core::DetachedVm;
use azgrid_detached::{serve, ExeConfig, JobRegistry, ServerState};
use azgrid_scaleset::vm;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn run_detached_server(
    bind: String,
    user: String,
    workdir: Option<String>,
    exename: String,
    exeflags: String,
) -> anyhow::Result<()> {
    info!("azgridd starting in detached-server mode");

    let bind: SocketAddr = bind.parse()?;
    let workdir = workdir
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("/home/{user}")));
    std::fs::create_dir_all(&workdir)?;

    let identity = discover_identity().await;
    info!(vm = %identity.name, ip = %identity.ip, "vm identity resolved");

    let exe = ExeConfig {
        exename,
        exeflags: exeflags.split_whitespace().map(str::to_string).collect(),
    };
    let registry = Arc::new(JobRegistry::new(workdir, exe));

    let (terminate_tx, mut terminate_rx) = mpsc::channel(1);
    let state = ServerState {
        registry,
        vm: identity.clone(),
        terminate: terminate_tx,
    };

    // Self-destruction for non-persistent jobs: delete this VM through
    // the management API once the job that asked for it finishes.
    tokio::spawn(async move {
        if terminate_rx.recv().await.is_some() {
            info!(vm = %identity.name, "deleting own vm");
            let client = AzureClient::new(Arc::new(EnvSession::default()));
            if let Err(e) = vm::delete_vm(
                &client,
                &identity.subscriptionid,
                &identity.resourcegroup,
                &identity.name,
            )
            .await
            {
                warn!(error = %e, "self-deletion failed, remove the vm manually");
            }
        }
    });

    serve(state, bind).await?;
    Ok(())
}

/// Identity from instance metadata; off-Azure (tests, local runs) the
/// fields that cannot be known degrade to empty strings.
async fn discover_identity() -> DetachedVm {
    let metadata = InstanceMetadata::new();
    match metadata.instance().await {
        Ok(instance) => {
            let compute = &instance["compute"];
            DetachedVm {
                name: compute["name"].as_str().unwrap_or_default().to_string(),
                ip: instance["network"]["interface"][0]["ipv4"]["ipAddress"][0]
                    ["privateIpAddress"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                subscriptionid: compute["subscriptionId"].as_str().unwrap_or_default().to_string(),
                resourcegroup: compute["resourceGroupName"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            }
        }
        Err(e) => {
            warn!(error = %e, "instance metadata unreachable, identity degraded");
            DetachedVm {
                name: hostname(),
                ip: String::new(),
                subscriptionid: String::new(),
                resourcegroup: String::new(),
            }
        }
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

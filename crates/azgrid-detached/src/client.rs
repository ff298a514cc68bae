//! Client side of detached jobs.
//!
//! Provisions the standalone VM (NIC first, then the VM, then a
//! readiness poll against the service), submits code, and maps the job
//! handle's operations onto the service's HTTP endpoints.

use std::time::Duration;

use azgrid_azure::{wait_for_quota, AzureClient};
use azgrid_core::{DetachedVm, Template, DETACHED_SERVICE_PORT};
use azgrid_scaleset::reconciler::{push_ssh_key, random_suffix};
use azgrid_scaleset::vm;
use azgrid_scaleset::{
    cloudinit, patch_image_reference, ImageSpec, ScalesetError, ScriptParams, SshKeys,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use tokio::sync::watch;
use tracing::info;

use crate::error::{DetachedError, DetachedResult};
use crate::spinner::Spinner;

/// How often the readiness probe polls `/ping`.
const PING_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Which capture stream to read from a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn path_segment(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Handle to a job running on a detached VM.
#[derive(Debug, Clone)]
pub struct DetachedJobHandle {
    pub vm: DetachedVm,
    pub id: String,
    pub log_url: String,
}

/// HTTP client for the detached service.
#[derive(Clone)]
pub struct DetachedClient {
    http: reqwest::Client,
    port: u16,
}

impl Default for DetachedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DetachedClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            port: DETACHED_SERVICE_PORT,
        }
    }

    /// Target a non-standard port (tests bind ephemerally).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn base(&self, ip: &str) -> String {
        format!("http://{ip}:{}/cofii/detached", self.port)
    }

    /// One liveness probe.
    pub async fn ping(&self, ip: &str) -> bool {
        let url = format!("{}/ping", self.base(ip));
        matches!(self.http.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    /// Poll `/ping` until the service answers, bounded by `timeout`,
    /// with a spinner for the human watching the provision.
    pub async fn wait_for_service(&self, ip: &str, timeout: Duration) -> DetachedResult<()> {
        let spinner = Spinner::start(&format!("waiting for detached service on {ip}"));
        let started = tokio::time::Instant::now();
        let result = loop {
            if self.ping(ip).await {
                break Ok(());
            }
            if started.elapsed() > timeout {
                break Err(DetachedError::Timeout(format!(
                    "detached service on {ip} not ready within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(PING_POLL_INTERVAL).await;
        };
        spinner.stop().await;
        result
    }

    /// Recover the full VM identity from a bare IP.
    pub async fn vm_identity(&self, ip: &str) -> DetachedResult<DetachedVm> {
        let url = format!("{}/vm", self.base(ip));
        let response = self.http.get(&url).send().await?;
        Ok(self.expect_ok(response).await?.json().await?)
    }

    /// Submit code; returns the job handle.
    pub async fn run(
        &self,
        vm_identity: &DetachedVm,
        code: &str,
        persist: bool,
        variablebundle: Option<&serde_json::Value>,
    ) -> DetachedResult<DetachedJobHandle> {
        let base = self.base(&vm_identity.ip);
        let mut payload = json!({"code": code, "persist": persist});
        if let Some(bundle) = variablebundle {
            payload["variablebundle"] = json!(STANDARD.encode(bundle.to_string()));
        }
        let response = self.http.post(format!("{base}/run")).json(&payload).send().await?;
        let body: serde_json::Value = self.expect_ok(response).await?.json().await?;
        let id = body["id"].as_str().unwrap_or_default().to_string();
        Ok(DetachedJobHandle {
            vm: vm_identity.clone(),
            log_url: format!("{base}/job/{id}/stdout"),
            id,
        })
    }

    /// Current status: `starting`, `running`, `done`, or `failed`.
    pub async fn status(&self, job: &DetachedJobHandle) -> DetachedResult<String> {
        let url = format!("{}/job/{}/status", self.base(&job.vm.ip), job.id);
        let response = self.http.get(&url).send().await?;
        let body: serde_json::Value = self.expect_ok(response).await?.json().await?;
        Ok(body["status"].as_str().unwrap_or_default().to_string())
    }

    /// Block until the job finishes. A failed job surfaces the error
    /// and code listing the service reports.
    pub async fn wait(&self, job: &DetachedJobHandle) -> DetachedResult<()> {
        let url = format!("{}/job/{}/wait", self.base(&job.vm.ip), job.id);
        let response = self.http.post(&url).send().await?;
        self.expect_ok(response).await?;
        Ok(())
    }

    /// Read captured stdout or stderr.
    pub async fn read(
        &self,
        job: &DetachedJobHandle,
        stream: OutputStream,
    ) -> DetachedResult<String> {
        let url = format!(
            "{}/job/{}/{}",
            self.base(&job.vm.ip),
            job.id,
            stream.path_segment()
        );
        let response = self.http.get(&url).send().await?;
        Ok(self.expect_ok(response).await?.text().await?)
    }

    async fn expect_ok(&self, response: reqwest::Response) -> DetachedResult<reqwest::Response> {
        let status = response.status().as_u16();
        if status >= 300 {
            let body = response.text().await.unwrap_or_default();
            return Err(DetachedError::Service { status, body });
        }
        Ok(response)
    }
}

/// Options for provisioning a standalone detached VM.
#[derive(Debug, Clone)]
pub struct AddProcOptions {
    pub subscription: String,
    pub resource_group: String,
    /// VM names are `<basename>-<4 random letters>`.
    pub basename: String,
    /// Boot the detached service instead of a cluster worker.
    pub detached_service: bool,
    /// Image override applied to the VM template.
    pub image: ImageSpec,
    pub ssh: SshKeys,
    /// Bound on provisioning and readiness polls (the runtime's worker
    /// timeout).
    pub timeout: Duration,
}

/// Provision one standalone VM: NIC, VM, provisioning poll, private
/// IP, and — for service VMs — a readiness poll against `/ping`.
pub async fn addproc(
    azure: &AzureClient,
    vm_template: &Template,
    nic_template: &Template,
    params: &mut ScriptParams,
    opts: &AddProcOptions,
    interrupt: &mut watch::Receiver<bool>,
) -> DetachedResult<DetachedVm> {
    let name = format!("{}-{}", opts.basename, random_suffix(4));
    let nic_name = format!("{name}-nic");

    info!(vm = %name, nic = %nic_name, "creating nic");
    let nic_id = vm::create_nic(
        azure,
        &opts.subscription,
        &opts.resource_group,
        &nic_name,
        &nic_template.value,
    )
    .await?;

    let mut body = vm_template.value.clone();
    patch_image_reference(&mut body, &opts.image)?;
    body["properties"]["networkProfile"]["networkInterfaces"] =
        json!([{"id": nic_id, "properties": {"primary": true}}]);
    body["properties"]["osProfile"]["computerName"] = json!(name);
    push_ssh_key(&mut body["properties"]["osProfile"], &opts.ssh);

    let script = if opts.detached_service {
        cloudinit::build_detached_script(params)
    } else {
        cloudinit::build_worker_script(params)
    };
    body["properties"]["osProfile"]["customData"] = json!(cloudinit::encode(&script));

    let sku = body["properties"]["hardwareProfile"]["vmSize"]
        .as_str()
        .ok_or_else(|| ScalesetError::Template("vm template has no hardwareProfile.vmSize".into()))?
        .to_string();
    let location = body["location"]
        .as_str()
        .ok_or_else(|| ScalesetError::Template("vm template has no location".into()))?
        .to_string();
    let spot = body["properties"]["priority"] == "Spot";
    wait_for_quota(azure, &opts.subscription, &location, &sku, 1, spot, interrupt).await?;

    info!(vm = %name, "creating vm");
    vm::create_vm(azure, &opts.subscription, &opts.resource_group, &name, &body).await?;
    vm::wait_for_provisioning(
        azure,
        &opts.subscription,
        &opts.resource_group,
        &name,
        opts.timeout,
        interrupt,
    )
    .await?;

    let nic = vm::get_nic(azure, &opts.subscription, &opts.resource_group, &nic_name).await?;
    let ip = vm::nic_private_ip(&nic)
        .ok_or_else(|| ScalesetError::Template("nic has no private ip address".into()))?;

    let vm_identity = DetachedVm {
        name,
        ip,
        subscriptionid: opts.subscription.clone(),
        resourcegroup: opts.resource_group.clone(),
    };

    if opts.detached_service {
        DetachedClient::new()
            .wait_for_service(&vm_identity.ip, opts.timeout)
            .await?;
    }

    info!(vm = %vm_identity.name, ip = %vm_identity.ip, "vm ready");
    Ok(vm_identity)
}

/// Tear down a detached VM and its NIC. The deletion poll warns and
/// continues on overrun — Azure finishes server-side.
pub async fn rmproc(
    azure: &AzureClient,
    vm_identity: &DetachedVm,
    timeout: Duration,
) -> DetachedResult<()> {
    vm::delete_vm(
        azure,
        &vm_identity.subscriptionid,
        &vm_identity.resourcegroup,
        &vm_identity.name,
    )
    .await?;
    vm::wait_until_deleted(
        azure,
        &vm_identity.subscriptionid,
        &vm_identity.resourcegroup,
        &vm_identity.name,
        timeout,
    )
    .await?;
    vm::delete_nic(
        azure,
        &vm_identity.subscriptionid,
        &vm_identity.resourcegroup,
        &format!("{}-nic", vm_identity.name),
    )
    .await?;
    Ok(())
}

/// Provision a fresh service VM and run `code` on it.
#[allow(clippy::too_many_arguments)]
pub async fn detached_run(
    azure: &AzureClient,
    code: &str,
    vm_template: &Template,
    nic_template: &Template,
    params: &mut ScriptParams,
    opts: &AddProcOptions,
    persist: bool,
    variablebundle: Option<&serde_json::Value>,
    interrupt: &mut watch::Receiver<bool>,
) -> DetachedResult<DetachedJobHandle> {
    let service_opts = AddProcOptions {
        detached_service: true,
        ..opts.clone()
    };
    let vm_identity = addproc(azure, vm_template, nic_template, params, &service_opts, interrupt).await?;
    DetachedClient::new()
        .run(&vm_identity, code, persist, variablebundle)
        .await
}

/// Run `code` on an already-provisioned service VM addressed by IP.
pub async fn detached_run_at(
    ip: &str,
    code: &str,
    persist: bool,
    variablebundle: Option<&serde_json::Value>,
) -> DetachedResult<DetachedJobHandle> {
    let client = DetachedClient::new();
    let vm_identity = client.vm_identity(ip).await?;
    client.run(&vm_identity, code, persist, variablebundle).await
}

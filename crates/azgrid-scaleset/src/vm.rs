//! Standalone VM and NIC operations.
//!
//! Detached jobs run on single VMs rather than scale sets: a NIC is
//! created first, its id injected into the VM template, and the VM is
//! polled to `Succeeded` before anyone talks to it. Deletion runs the
//! same dance in reverse.

use std::time::Duration;

use azgrid_azure::{AzureClient, AzureResult};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{ScalesetError, ScalesetResult};

const VM_API: &str = "2019-07-01";
const NIC_WRITE_API: &str = "2019-11-01";
const NIC_READ_API: &str = "2020-03-01";

/// How often VM provisioning state is polled.
const VM_POLL_INTERVAL: Duration = Duration::from_secs(10);

fn vm_url(client: &AzureClient, subscription: &str, resource_group: &str, name: &str) -> String {
    client.url(&format!(
        "/subscriptions/{subscription}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachines/{name}?api-version={VM_API}"
    ))
}

fn nic_url(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
    name: &str,
    api_version: &str,
) -> String {
    client.url(&format!(
        "/subscriptions/{subscription}/resourceGroups/{resource_group}/providers/Microsoft.Network/networkInterfaces/{name}?api-version={api_version}"
    ))
}

/// PUT a NIC and return its resource id.
pub async fn create_nic(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
    name: &str,
    template: &Value,
) -> AzureResult<String> {
    let url = nic_url(client, subscription, resource_group, name, NIC_WRITE_API);
    let created = client.put(&url, template).await?;
    Ok(created["id"].as_str().unwrap_or_default().to_string())
}

pub async fn get_nic(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
    name: &str,
) -> AzureResult<Value> {
    client
        .get(&nic_url(client, subscription, resource_group, name, NIC_READ_API))
        .await
}

pub async fn delete_nic(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
    name: &str,
) -> AzureResult<()> {
    client
        .delete(&nic_url(client, subscription, resource_group, name, NIC_WRITE_API))
        .await?;
    Ok(())
}

/// The private address of a NIC's first IP configuration.
pub fn nic_private_ip(nic: &Value) -> Option<String> {
    nic["properties"]["ipConfigurations"]
        .as_array()
        .and_then(|configs| configs.first())
        .and_then(|c| c["properties"]["privateIPAddress"].as_str())
        .map(str::to_string)
}

pub async fn create_vm(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
    name: &str,
    body: &Value,
) -> AzureResult<Value> {
    client
        .put(&vm_url(client, subscription, resource_group, name), body)
        .await
}

pub async fn get_vm(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
    name: &str,
) -> AzureResult<Value> {
    client
        .get(&vm_url(client, subscription, resource_group, name))
        .await
}

pub async fn delete_vm(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
    name: &str,
) -> AzureResult<()> {
    client
        .delete(&vm_url(client, subscription, resource_group, name))
        .await?;
    info!(vm = name, "vm delete issued");
    Ok(())
}

pub async fn list_vms(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
) -> AzureResult<Vec<Value>> {
    let url = client.url(&format!(
        "/subscriptions/{subscription}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachines?api-version={VM_API}"
    ));
    let body = client.get(&url).await?;
    Ok(body["value"].as_array().cloned().unwrap_or_default())
}

/// Poll a VM every 10 s until `provisioningState` reaches `Succeeded`.
///
/// `Failed` is fatal; exceeding `timeout` is an error; the interrupt
/// channel aborts the wait.
pub async fn wait_for_provisioning(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
    name: &str,
    timeout: Duration,
    interrupt: &mut watch::Receiver<bool>,
) -> ScalesetResult<()> {
    let started = tokio::time::Instant::now();
    loop {
        if *interrupt.borrow() {
            return Err(azgrid_azure::AzureError::Interrupted.into());
        }
        let vm = get_vm(client, subscription, resource_group, name).await?;
        match vm["properties"]["provisioningState"].as_str() {
            Some("Succeeded") => return Ok(()),
            Some("Failed") => return Err(ScalesetError::Provision(name.to_string())),
            state => {
                tracing::debug!(vm = name, ?state, "waiting for provisioning");
            }
        }
        if started.elapsed() > timeout {
            return Err(ScalesetError::Timeout(format!(
                "vm {name} not provisioned within {}s",
                timeout.as_secs()
            )));
        }
        tokio::select! {
            _ = tokio::time::sleep(VM_POLL_INTERVAL) => {}
            _ = interrupt.changed() => return Err(azgrid_azure::AzureError::Interrupted.into()),
        }
    }
}

/// Poll the VM list until `name` disappears. Overrunning the timeout
/// warns and returns — deletion continues server-side.
pub async fn wait_until_deleted(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
    name: &str,
    timeout: Duration,
) -> AzureResult<()> {
    let started = tokio::time::Instant::now();
    loop {
        let vms = list_vms(client, subscription, resource_group).await?;
        if !vms.iter().any(|vm| vm["name"] == name) {
            return Ok(());
        }
        if started.elapsed() > timeout {
            warn!(vm = name, "vm still listed after delete timeout, continuing");
            return Ok(());
        }
        tokio::time::sleep(VM_POLL_INTERVAL).await;
    }
}

//! Scale-set reconciliation.
//!
//! Drives a scale set to a target capacity: patches the template
//! (name prefix, SSH key, startup script, spot settings), creates the
//! resource empty if it does not exist, waits for quota, then submits
//! the capacity change. The scale set's ultimate capacity is the sum of
//! deltas ever requested minus deltas removed.

use azgrid_azure::{wait_for_quota, AzureClient, AzureResult};
use azgrid_core::{ScaleSetKey, Template, WorkerUserdata};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{ScalesetError, ScalesetResult};
use crate::image::{patch_image_reference, ImageSpec};

const SCALESET_API: &str = "2019-12-01";
const INSTANCE_API: &str = "2018-06-01";

/// SSH identity appended to every provisioned machine.
#[derive(Debug, Clone)]
pub struct SshKeys {
    pub user: String,
    pub public_key: String,
}

fn scaleset_url(client: &AzureClient, key: &ScaleSetKey) -> String {
    client.url(&format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}?api-version={SCALESET_API}",
        key.subscription, key.resource_group, key.scaleset
    ))
}

/// List every scale set in a resource group, following `nextLink`
/// pages with the same client.
pub async fn list_scalesets(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
) -> AzureResult<Vec<Value>> {
    let mut url = client.url(&format!(
        "/subscriptions/{subscription}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachineScaleSets?api-version={SCALESET_API}"
    ));
    let mut out = Vec::new();
    loop {
        let page = client.get(&url).await?;
        if let Some(items) = page["value"].as_array() {
            out.extend(items.iter().cloned());
        }
        match page["nextLink"].as_str() {
            Some(next) if !next.is_empty() => url = next.to_string(),
            _ => break,
        }
    }
    Ok(out)
}

/// Create a scale set or grow an existing one by `delta` instances.
///
/// `custom_data` is the base64 startup script; `image` overrides the
/// template's image reference when non-empty. Returns the new total
/// capacity.
#[allow(clippy::too_many_arguments)]
pub async fn create_or_update(
    client: &AzureClient,
    key: &ScaleSetKey,
    delta: u64,
    template: &Template,
    image: &ImageSpec,
    custom_data: &str,
    ssh: &SshKeys,
    spot: bool,
    max_price: f64,
    interrupt: &mut watch::Receiver<bool>,
) -> ScalesetResult<u64> {
    let existing = list_scalesets(client, &key.subscription, &key.resource_group)
        .await?
        .into_iter()
        .find(|s| s["name"] == key.scaleset.as_str());

    let mut body = template.value.clone();
    patch_image_reference(&mut body, image)?;
    let os_profile = &mut body["properties"]["virtualMachineProfile"]["osProfile"];

    // A fresh group gets a random prefix; growing reuses the existing
    // one so hostnames stay in one namespace.
    os_profile["computerNamePrefix"] = match &existing {
        Some(current) => {
            current["properties"]["virtualMachineProfile"]["osProfile"]["computerNamePrefix"].clone()
        }
        None => json!(format!("{}-{}-", key.scaleset, random_suffix(4))),
    };
    os_profile["customData"] = json!(custom_data);

    push_ssh_key(os_profile, ssh);

    if spot {
        let vm_profile = &mut body["properties"]["virtualMachineProfile"];
        vm_profile["priority"] = json!("Spot");
        vm_profile["evictionPolicy"] = json!("Delete");
        vm_profile["billingProfile"] = json!({"maxPrice": max_price});
    }

    let url = scaleset_url(client, key);

    let current_capacity = match &existing {
        Some(current) => current["sku"]["capacity"].as_u64().unwrap_or(0),
        None => {
            // Create the resource with no instances first; capacity
            // arrives in a second PUT once quota clears.
            body["sku"]["capacity"] = json!(0);
            client.put(&url, &body).await?;
            info!(scaleset = %key, "scale set created empty");
            0
        }
    };

    let sku_name = body["sku"]["name"]
        .as_str()
        .ok_or_else(|| ScalesetError::Template("template has no sku.name".into()))?
        .to_string();
    let location = body["location"]
        .as_str()
        .ok_or_else(|| ScalesetError::Template("template has no location".into()))?
        .to_string();

    wait_for_quota(
        client,
        &key.subscription,
        &location,
        &sku_name,
        delta as i64,
        spot,
        interrupt,
    )
    .await?;

    let target = current_capacity + delta;
    body["sku"]["capacity"] = json!(target);
    client.put(&url, &body).await?;
    info!(scaleset = %key, capacity = target, "scale set capacity updated");
    Ok(target)
}

/// Append the master's public key to an `osProfile`'s SSH key list,
/// creating the list when the template has none. Shared by the
/// scale-set and standalone-VM paths.
pub fn push_ssh_key(os_profile: &mut Value, ssh: &SshKeys) {
    let keys = &mut os_profile["linuxConfiguration"]["ssh"]["publicKeys"];
    if !keys.is_array() {
        *keys = json!([]);
    }
    keys.as_array_mut()
        .expect("publicKeys was just coerced to an array")
        .push(json!({
            "path": format!("/home/{}/.ssh/authorized_keys", ssh.user),
            "keyData": ssh.public_key,
        }));
}

/// Random lowercase suffix used to keep generated resource names
/// unique (`<group>-<suffix>-` prefixes, one-off VM names).
pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..26u8);
            (b'a' + idx) as char
        })
        .collect()
}

/// Delete the whole scale set.
pub async fn delete_scaleset(client: &AzureClient, key: &ScaleSetKey) -> AzureResult<()> {
    client.delete(&scaleset_url(client, key)).await?;
    info!(scaleset = %key, "scale set deleted");
    Ok(())
}

/// Delete specific instances from a scale set.
pub async fn delete_instances(
    client: &AzureClient,
    key: &ScaleSetKey,
    instance_ids: &[String],
) -> AzureResult<()> {
    let url = client.url(&format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}/delete?api-version={INSTANCE_API}",
        key.subscription, key.resource_group, key.scaleset
    ));
    client.post(&url, &json!({"instanceIds": instance_ids})).await?;
    debug!(scaleset = %key, ?instance_ids, "instance delete issued");
    Ok(())
}

/// GET one scale-set instance; the caller inspects 404s during delete
/// verification.
pub async fn get_instance(
    client: &AzureClient,
    key: &ScaleSetKey,
    instance_id: &str,
) -> AzureResult<Value> {
    let url = client.url(&format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}/virtualmachines/{instance_id}?api-version={INSTANCE_API}",
        key.subscription, key.resource_group, key.scaleset
    ));
    client.get(&url).await
}

/// List the VMs currently in a scale set.
pub async fn list_instances(client: &AzureClient, key: &ScaleSetKey) -> AzureResult<Vec<Value>> {
    let url = client.url(&format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}/virtualMachines?api-version={SCALESET_API}",
        key.subscription, key.resource_group, key.scaleset
    ));
    let body = client.get(&url).await?;
    Ok(body["value"].as_array().cloned().unwrap_or_default())
}

/// True iff the worker's VM still appears in its scale set.
pub async fn is_vm_in_scaleset(
    client: &AzureClient,
    userdata: &WorkerUserdata,
) -> AzureResult<bool> {
    let instances = list_instances(client, &userdata.scaleset_key()).await?;
    Ok(instances.iter().any(|vm| vm["name"] == userdata.name.as_str()))
}

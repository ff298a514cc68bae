//! Compute quota checks.
//!
//! Before a scale set grows, the reconciler verifies the subscription
//! has core headroom for the requested SKU — regular and spot cores are
//! separate pools. Insufficient quota is a soft failure: callers wait
//! and re-check until capacity frees up or the user interrupts.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::client::AzureClient;
use crate::error::{AzureError, AzureResult};

/// How long to sleep between quota re-checks.
const QUOTA_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Core headroom left after accounting for a pending request.
/// Negative means the request would exceed the limit.
#[derive(Debug, Clone, Copy)]
pub struct QuotaAvailability {
    pub regular: i64,
    pub spot: i64,
}

/// Look up `(family, vCPUs)` for a SKU in a location-filtered SKU list.
fn resolve_sku(skus: &Value, sku_name: &str) -> AzureResult<(String, i64)> {
    let entries = skus["value"]
        .as_array()
        .ok_or_else(|| AzureError::Malformed("sku list has no 'value' array".into()))?;
    let sku = entries
        .iter()
        .find(|s| s["name"] == sku_name)
        .ok_or_else(|| AzureError::Malformed(format!("sku not found: {sku_name}")))?;
    let family = sku["family"]
        .as_str()
        .ok_or_else(|| AzureError::Malformed(format!("sku {sku_name} has no family")))?
        .to_string();
    let vcpus = sku["capabilities"]
        .as_array()
        .and_then(|caps| caps.iter().find(|c| c["name"] == "vCPUs"))
        .and_then(|c| c["value"].as_str())
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| AzureError::Malformed(format!("sku {sku_name} has no vCPUs capability")))?;
    Ok((family, vcpus))
}

/// `limit - currentValue` for a usage entry keyed by `name.value`.
fn usage_headroom(usages: &Value, key: &str) -> AzureResult<i64> {
    let entries = usages["value"]
        .as_array()
        .ok_or_else(|| AzureError::Malformed("usage list has no 'value' array".into()))?;
    let entry = entries
        .iter()
        .find(|u| u["name"]["value"] == key)
        .ok_or_else(|| AzureError::Malformed(format!("usage entry not found: {key}")))?;
    let limit = entry["limit"].as_i64().unwrap_or(0);
    let current = entry["currentValue"].as_i64().unwrap_or(0);
    Ok(limit - current)
}

/// Check core headroom for `nrequested` machines of `sku_name` in a
/// location, for both priority classes.
pub async fn quota_check(
    client: &AzureClient,
    subscription: &str,
    location: &str,
    sku_name: &str,
    nrequested: i64,
) -> AzureResult<QuotaAvailability> {
    let skus_url = client.url(&format!(
        "/subscriptions/{subscription}/providers/Microsoft.Compute/skus\
         ?api-version=2019-04-01&$filter=location eq '{location}'"
    ));
    let skus = client.get(&skus_url).await?;
    let (family, vcpus) = resolve_sku(&skus, sku_name)?;

    let usages_url = client.url(&format!(
        "/subscriptions/{subscription}/providers/Microsoft.Compute/locations/{location}/usages\
         ?api-version=2019-07-01"
    ));
    let usages = client.get(&usages_url).await?;

    let requested_cores = nrequested * vcpus;
    let availability = QuotaAvailability {
        regular: usage_headroom(&usages, &family)? - requested_cores,
        spot: usage_headroom(&usages, "lowPriorityCores")? - requested_cores,
    };
    debug!(
        sku = sku_name,
        family = %family,
        regular = availability.regular,
        spot = availability.spot,
        "quota checked"
    );
    Ok(availability)
}

/// Block until the requested capacity fits in quota, re-checking once a
/// minute. The interrupt channel aborts the wait with
/// [`AzureError::Interrupted`].
pub async fn wait_for_quota(
    client: &AzureClient,
    subscription: &str,
    location: &str,
    sku_name: &str,
    nrequested: i64,
    spot: bool,
    interrupt: &mut watch::Receiver<bool>,
) -> AzureResult<()> {
    loop {
        if *interrupt.borrow() {
            return Err(AzureError::Interrupted);
        }
        let availability =
            quota_check(client, subscription, location, sku_name, nrequested).await?;
        let headroom = if spot {
            availability.spot
        } else {
            availability.regular
        };
        if headroom >= 0 {
            return Ok(());
        }
        info!(
            sku = sku_name,
            headroom,
            spot,
            "insufficient quota, waiting for capacity"
        );
        tokio::select! {
            _ = tokio::time::sleep(QUOTA_POLL_INTERVAL) => {}
            _ = interrupt.changed() => return Err(AzureError::Interrupted),
        }
    }
}

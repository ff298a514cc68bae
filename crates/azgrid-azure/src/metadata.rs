//! Azure instance metadata service.
//!
//! Workers and masters that themselves run on Azure can discover the
//! image they booted from and watch for spot preemption through the
//! link-local metadata endpoint. All calls are bounded at five seconds
//! so an off-Azure master fails fast instead of hanging.

use std::time::Duration;

use serde_json::Value;

use crate::error::{AzureError, AzureResult};

pub const METADATA_ENDPOINT: &str = "http://169.254.169.254";

/// Client for the link-local instance metadata service.
#[derive(Clone)]
pub struct InstanceMetadata {
    http: reqwest::Client,
    endpoint: String,
}

impl Default for InstanceMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceMetadata {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            endpoint: METADATA_ENDPOINT.to_string(),
        }
    }

    /// Point at a different endpoint (tests use an in-process server).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn get(&self, path: &str) -> AzureResult<Value> {
        let url = format!("{}{}", self.endpoint, path);
        let resp = self.http.get(&url).header("Metadata", "true").send().await?;
        let status = resp.status().as_u16();
        if status >= 300 {
            let body = resp.text().await.unwrap_or_default();
            return Err(AzureError::Status {
                status,
                retry_after: None,
                body,
            });
        }
        Ok(resp.json().await?)
    }

    /// Full instance document.
    pub async fn instance(&self) -> AzureResult<Value> {
        self.get("/metadata/instance?api-version=2020-06-01").await
    }

    /// The image reference this VM booted from.
    pub async fn image_reference(&self) -> AzureResult<Value> {
        self.get("/metadata/instance/compute/storageProfile/imageReference?api-version=2019-06-01")
            .await
    }

    /// Pending maintenance/preemption events for this VM.
    pub async fn scheduled_events(&self) -> AzureResult<Value> {
        self.get("/metadata/scheduledevents?api-version=2019-08-01")
            .await
    }

    /// True iff a spot eviction has been scheduled for this VM.
    pub async fn preempted(&self) -> AzureResult<bool> {
        let events = self.scheduled_events().await?;
        Ok(events["Events"]
            .as_array()
            .map(|events| events.iter().any(|e| e["EventType"] == "Preempt"))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    #[test]
    fn preempt_detection_logic() {
        let events = json!({"Events": [
            {"EventType": "Freeze"},
            {"EventType": "Preempt"}
        ]});
        let hit = events["Events"]
            .as_array()
            .map(|e| e.iter().any(|e| e["EventType"] == "Preempt"))
            .unwrap_or(false);
        assert!(hit);

        let none = json!({"Events": []});
        let hit = none["Events"]
            .as_array()
            .map(|e| e.iter().any(|e| e["EventType"] == "Preempt"))
            .unwrap_or(false);
        assert!(!hit);
    }
}

//! HTTP client for the Ironic bare metal API
//!
//! Talks to a `noauth` Ironic endpoint: no token handling, a fixed API
//! microversion header and no retries. Anything fancier belongs in front of
//! this client, not in the orchestrator.
//! https://docs.openstack.org/api-ref/baremetal/

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{Node, NodeClient, PatchOperation, ProvisionTarget};
use crate::{DeployError, config::IronicSettings};

/// Header carrying the requested API microversion
const MICROVERSION_HEADER: &str = "X-OpenStack-Ironic-API-Version";

/// Oldest microversion that accepts a config drive as a JSON document
pub const DEFAULT_MICROVERSION: &str = "1.46";

/// Body of `PUT /v1/nodes/{id}/states/provision`
#[derive(Debug, Serialize)]
struct ProvisionStateRequest<'a> {
    target: ProvisionTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    configdrive: Option<&'a str>,
}

/// Ironic wraps a JSON document inside the `error_message` string
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error_message: String,
}

#[derive(Debug, Deserialize)]
struct Fault {
    faultstring: String,
}

/// Ironic API client
pub struct IronicClient {
    client: Client,
    base_url: String,
    microversion: String,
}

impl IronicClient {
    /// Create a client for `endpoint` with default settings
    ///
    /// The endpoint may be given with or without the trailing `/v1`.
    pub fn new(endpoint: &str) -> Result<Self, DeployError> {
        Self::with_options(endpoint, DEFAULT_MICROVERSION, Duration::from_secs(30))
    }

    /// Create a client from loaded settings
    pub fn from_settings(settings: &IronicSettings) -> Result<Self, DeployError> {
        Self::with_options(
            &settings.endpoint,
            &settings.microversion,
            Duration::from_secs(settings.request_timeout_secs),
        )
    }

    pub fn with_options(
        endpoint: &str,
        microversion: &str,
        timeout: Duration,
    ) -> Result<Self, DeployError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| DeployError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = endpoint.trim_end_matches('/');
        let base_url = base_url.strip_suffix("/v1").unwrap_or(base_url);

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            microversion: microversion.to_string(),
        })
    }

    fn node_url(&self, node_id: &str) -> String {
        format!("{}/v1/nodes/{}", self.base_url, node_id)
    }

    /// Turn a non-success response into a transport error
    async fn check(response: Response, operation: &str) -> Result<Response, DeployError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeployError::Transport {
            operation: operation.to_string(),
            status: Some(status.as_u16()),
            message: extract_fault(&body).unwrap_or_else(|| format!("HTTP {}", status)),
        })
    }
}

/// Pull the human readable fault out of an Ironic error body
fn extract_fault(body: &str) -> Option<String> {
    let outer: ErrorBody = serde_json::from_str(body).ok()?;
    match serde_json::from_str::<Fault>(&outer.error_message) {
        Ok(fault) => Some(fault.faultstring),
        Err(_) => Some(outer.error_message),
    }
}

#[async_trait]
impl NodeClient for IronicClient {
    async fn get_node(&self, node_id: &str) -> Result<Node, DeployError> {
        let url = self.node_url(node_id);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(MICROVERSION_HEADER, &self.microversion)
            .send()
            .await?;

        let response = Self::check(response, "get node").await?;
        Ok(response.json().await?)
    }

    async fn change_provision_state(
        &self,
        node_id: &str,
        target: ProvisionTarget,
        config_drive: Option<&str>,
    ) -> Result<(), DeployError> {
        let url = format!("{}/states/provision", self.node_url(node_id));
        debug!("PUT {} (target: {})", url, target);

        let response = self
            .client
            .put(&url)
            .header(MICROVERSION_HEADER, &self.microversion)
            .json(&ProvisionStateRequest {
                target,
                configdrive: config_drive,
            })
            .send()
            .await?;

        Self::check(response, &format!("provision state change to '{}'", target)).await?;
        Ok(())
    }

    async fn patch_node(
        &self,
        node_id: &str,
        operations: &[PatchOperation],
    ) -> Result<(), DeployError> {
        let url = self.node_url(node_id);
        debug!("PATCH {} ({} operations)", url, operations.len());

        let response = self
            .client
            .patch(&url)
            .header(MICROVERSION_HEADER, &self.microversion)
            .json(operations)
            .send()
            .await?;

        Self::check(response, "patch node").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let client = IronicClient::new("http://localhost:6385/v1/").unwrap();
        assert_eq!(client.base_url, "http://localhost:6385");
        assert_eq!(
            client.node_url("abc"),
            "http://localhost:6385/v1/nodes/abc"
        );

        let client = IronicClient::new("http://ironic.example.com").unwrap();
        assert_eq!(client.base_url, "http://ironic.example.com");
        assert_eq!(client.microversion, DEFAULT_MICROVERSION);
    }

    #[test]
    fn test_extract_fault_nested() {
        let body = r#"{"error_message": "{\"faultstring\": \"Node abc could not be found.\", \"debuginfo\": null}"}"#;
        assert_eq!(
            extract_fault(body).as_deref(),
            Some("Node abc could not be found.")
        );
    }

    #[test]
    fn test_extract_fault_plain() {
        let body = r#"{"error_message": "something broke"}"#;
        assert_eq!(extract_fault(body).as_deref(), Some("something broke"));
        assert_eq!(extract_fault("<html>502</html>"), None);
    }

    #[test]
    fn test_provision_request_body() {
        let body = ProvisionStateRequest {
            target: ProvisionTarget::Active,
            configdrive: Some("H4sI"),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"target": "active", "configdrive": "H4sI"})
        );

        let body = ProvisionStateRequest {
            target: ProvisionTarget::Manage,
            configdrive: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"target": "manage"})
        );
    }
}

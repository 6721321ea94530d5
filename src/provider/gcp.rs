//! # GCP Compute REST Adapter
//!
//! Native REST implementation of [`ComputeProvider`] against the Compute
//! Engine API v1. Uses reqwest with rustls and an OAuth2 bearer token from
//! the metadata server (or `GCP_ACCESS_TOKEN` for local runs and tests).
//!
//! This is the adapter layer: raw JSON payloads are deserialized into the
//! typed records in [`crate::provider`] here and nowhere else.
//!
//! References:
//! - [Compute Engine REST API v1](https://cloud.google.com/compute/docs/reference/rest/v1)

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::InstanceTemplate;
use crate::provider::{
    BatchCallback, BatchCreateRequest, BatchItemOutcome, ComputeProvider, InstanceMetadata,
    InstanceRecord, InstanceStatus, MetadataItem, Operation, OperationStatus, ProviderError,
    Scope,
};

const DEFAULT_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Simultaneous create sub-requests per batch submission
const BATCH_CONCURRENCY: usize = 16;

/// GCP Compute Engine REST client
pub struct GcpCompute {
    http: Client,
    base_url: String,
    access_token: String,
}

impl std::fmt::Debug for GcpCompute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpCompute")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Request structures (Compute Engine instances.insert and setMetadata)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertInstanceRequest {
    name: String,
    machine_type: String,
    disks: Vec<AttachedDisk>,
    can_ip_forward: bool,
    service_accounts: Vec<ServiceAccount>,
    network_interfaces: Vec<NetworkInterfaceSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduling: Option<Scheduling>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<Tags>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachedDisk {
    boot: bool,
    auto_delete: bool,
    mode: String,
    #[serde(rename = "type")]
    disk_type: String,
    initialize_params: InitializeParams,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    source_image: String,
    disk_size_gb: u64,
}

#[derive(Debug, Serialize)]
struct ServiceAccount {
    email: String,
    scopes: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterfaceSpec {
    subnetwork: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_configs: Option<Vec<AccessConfig>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
    name: String,
    #[serde(rename = "type")]
    config_type: String,
}

#[derive(Debug, Serialize)]
struct Scheduling {
    preemptible: bool,
}

#[derive(Debug, Serialize)]
struct Tags {
    items: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SetMetadataRequest {
    kind: &'static str,
    fingerprint: String,
    items: Vec<MetadataItem>,
}

// ============================================================================
// Response structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct InstanceListResponse {
    #[serde(default)]
    items: Vec<InstanceResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceResource {
    name: String,
    status: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterfaceStatus>,
    #[serde(default)]
    metadata: Option<MetadataResource>,
}

#[derive(Debug, Deserialize)]
struct NetworkInterfaceStatus {
    #[serde(rename = "networkIP", default)]
    network_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetadataResource {
    #[serde(default)]
    fingerprint: String,
    #[serde(default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResource {
    self_link: String,
}

#[derive(Debug, Deserialize)]
struct OperationResource {
    name: String,
    status: String,
    #[serde(default)]
    error: Option<OperationErrors>,
}

#[derive(Debug, Deserialize)]
struct OperationErrors {
    #[serde(default)]
    errors: Vec<OperationErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct OperationErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: u16,
    message: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl InstanceResource {
    fn to_record(&self) -> InstanceRecord {
        let status = if self.status == "RUNNING" {
            InstanceStatus::Running
        } else {
            InstanceStatus::Other(self.status.clone())
        };
        let network_address = self
            .network_interfaces
            .first()
            .and_then(|iface| iface.network_ip.clone())
            .unwrap_or_default();
        InstanceRecord {
            name: self.name.clone(),
            network_address,
            status,
        }
    }
}

fn parse_operation(resource: OperationResource) -> Operation {
    let status = match resource.status.as_str() {
        "DONE" => OperationStatus::Done,
        "PENDING" => OperationStatus::Pending,
        _ => OperationStatus::Running,
    };
    let error = resource.error.map(|wrapper| {
        wrapper
            .errors
            .iter()
            .map(|entry| format!("{}: {}", entry.code, entry.message))
            .collect::<Vec<_>>()
            .join("; ")
    });
    Operation {
        name: resource.name,
        status,
        error,
    }
}

fn build_insert_request(
    name: &str,
    template: &InstanceTemplate,
    source_image: &str,
) -> InsertInstanceRequest {
    let access_configs = template.external_access.then(|| {
        vec![AccessConfig {
            name: "external-nat".to_string(),
            config_type: "ONE_TO_ONE_NAT".to_string(),
        }]
    });
    InsertInstanceRequest {
        name: name.to_string(),
        machine_type: format!(
            "zones/{}/machineTypes/{}",
            template.zone, template.instance_type
        ),
        disks: vec![AttachedDisk {
            boot: true,
            auto_delete: true,
            mode: template.disk_mode.clone(),
            disk_type: template.disk_type.clone(),
            initialize_params: InitializeParams {
                source_image: source_image.to_string(),
                disk_size_gb: template.disk_size_gb,
            },
        }],
        can_ip_forward: template.can_ip_forward,
        service_accounts: vec![ServiceAccount {
            email: "default".to_string(),
            scopes: vec![template.api_scope.clone()],
        }],
        network_interfaces: vec![NetworkInterfaceSpec {
            subnetwork: template.subnet.clone(),
            access_configs,
        }],
        scheduling: template
            .preemptible
            .then(|| Scheduling { preemptible: true }),
        tags: (!template.tags.is_empty()).then(|| Tags {
            items: template.tags.clone(),
        }),
    }
}

impl GcpCompute {
    /// Create a client, resolving the API endpoint and an access token.
    ///
    /// `COMPUTE_API_ENDPOINT` overrides the base URL (mock servers, local
    /// testing); `GCP_ACCESS_TOKEN` short-circuits the metadata-server token
    /// fetch.
    pub async fn new() -> Result<Self, ProviderError> {
        let base_url = std::env::var("COMPUTE_API_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let http = Client::builder()
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        let access_token = Self::fetch_access_token(&http).await?;
        info!("initialized compute client for {base_url}");
        Ok(Self {
            http,
            base_url,
            access_token,
        })
    }

    async fn fetch_access_token(http: &Client) -> Result<String, ProviderError> {
        if let Ok(token) = std::env::var("GCP_ACCESS_TOKEN") {
            debug!("using access token from environment");
            return Ok(token);
        }
        let response = http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProviderError::Auth(format!(
                "metadata server returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    fn zone_url(&self, scope: &Scope, suffix: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{}",
            self.base_url, scope.project, scope.zone, suffix
        )
    }

    /// Map a non-success response into a [`ProviderError`], draining the body
    async fn api_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        match response.json::<ApiErrorResponse>().await {
            Ok(body) => ProviderError::Api {
                code: body.error.code,
                message: body.error.message,
            },
            Err(_) => ProviderError::Api {
                code: status,
                message: "unparseable error body".to_string(),
            },
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn resolve_source_image(
        &self,
        template: &InstanceTemplate,
    ) -> Result<String, ProviderError> {
        let url = match template.image_name.as_deref().filter(|n| !n.is_empty()) {
            Some(image_name) => format!(
                "{}/projects/{}/global/images/{}",
                self.base_url, template.image_project, image_name
            ),
            None => format!(
                "{}/projects/{}/global/images/family/{}",
                self.base_url, template.image_project, template.image_family
            ),
        };
        let image: ImageResource = self.get_json(&url).await?;
        Ok(image.self_link)
    }
}

#[async_trait]
impl ComputeProvider for GcpCompute {
    async fn list_instances(&self, scope: &Scope) -> Result<Vec<InstanceRecord>, ProviderError> {
        let url = self.zone_url(scope, "instances");
        let listing: InstanceListResponse = self.get_json(&url).await?;
        Ok(listing.items.iter().map(InstanceResource::to_record).collect())
    }

    async fn get_instance_metadata(
        &self,
        scope: &Scope,
        name: &str,
    ) -> Result<InstanceMetadata, ProviderError> {
        let url = self.zone_url(scope, &format!("instances/{name}"));
        let instance: InstanceResource = self.get_json(&url).await?;
        let metadata = instance
            .metadata
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))?;
        Ok(InstanceMetadata {
            fingerprint: metadata.fingerprint,
            items: metadata.items,
        })
    }

    async fn create_instance(
        &self,
        scope: &Scope,
        name: &str,
        template: &InstanceTemplate,
    ) -> Result<Operation, ProviderError> {
        let source_image = self.resolve_source_image(template).await?;
        let body = build_insert_request(name, template, &source_image);
        let url = self.zone_url(scope, "instances");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let operation: OperationResource = response.json().await?;
        Ok(parse_operation(operation))
    }

    async fn delete_instance(
        &self,
        scope: &Scope,
        name: &str,
    ) -> Result<Operation, ProviderError> {
        let url = self.zone_url(scope, &format!("instances/{name}"));
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let operation: OperationResource = response.json().await?;
        Ok(parse_operation(operation))
    }

    async fn get_operation(&self, scope: &Scope, name: &str) -> Result<Operation, ProviderError> {
        let url = self.zone_url(scope, &format!("operations/{name}"));
        let operation: OperationResource = self.get_json(&url).await?;
        Ok(parse_operation(operation))
    }

    async fn set_instance_metadata(
        &self,
        scope: &Scope,
        name: &str,
        fingerprint: &str,
        items: &[MetadataItem],
    ) -> Result<Operation, ProviderError> {
        let url = self.zone_url(scope, &format!("instances/{name}/setMetadata"));
        let body = SetMetadataRequest {
            kind: "compute#metadata",
            fingerprint: fingerprint.to_string(),
            items: items.to_vec(),
        };
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        // 412 is the provider rejecting a stale fingerprint
        if response.status().as_u16() == 412 {
            return Err(ProviderError::StaleFingerprint(name.to_string()));
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let operation: OperationResource = response.json().await?;
        Ok(parse_operation(operation))
    }

    async fn submit_batch(
        &self,
        scope: &Scope,
        requests: Vec<BatchCreateRequest>,
        on_complete: BatchCallback<'_>,
    ) -> Result<(), ProviderError> {
        // Resolve the image once up front; a failure here fails the whole
        // submission, which the coordinator retries as a unit.
        let Some(first) = requests.first() else {
            return Ok(());
        };
        let source_image = self.resolve_source_image(&first.template).await?;

        let mut outcomes = stream::iter(requests.into_iter().map(|request| {
            let source_image = source_image.clone();
            async move {
                let body = build_insert_request(&request.name, &request.template, &source_image);
                let url = self.zone_url(scope, "instances");
                let result = async {
                    let response = self
                        .http
                        .post(&url)
                        .bearer_auth(&self.access_token)
                        .json(&body)
                        .send()
                        .await?;
                    if !response.status().is_success() {
                        return Err(Self::api_error(response).await);
                    }
                    let operation: OperationResource = response.json().await?;
                    Ok(parse_operation(operation))
                }
                .await;
                BatchItemOutcome {
                    token: request.token,
                    result,
                }
            }
        }))
        .buffer_unordered(BATCH_CONCURRENCY);

        while let Some(outcome) = outcomes.next().await {
            on_complete(outcome);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> InstanceTemplate {
        serde_yaml::from_str(
            "project: perf-project\nsubnet: regions/us-central1/subnetworks/perf\n",
        )
        .unwrap()
    }

    #[test]
    fn insert_request_matches_api_shape() {
        let body = build_insert_request("perf-client-1", &template(), "projects/x/images/img");
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["name"], "perf-client-1");
        assert_eq!(
            value["machineType"],
            "zones/us-central1-b/machineTypes/n1-standard-1"
        );
        assert_eq!(value["disks"][0]["boot"], true);
        assert_eq!(value["disks"][0]["initializeParams"]["diskSizeGb"], 40);
        assert_eq!(
            value["networkInterfaces"][0]["accessConfigs"][0]["type"],
            "ONE_TO_ONE_NAT"
        );
        // Defaults: not preemptible, no tags
        assert!(value.get("scheduling").is_none());
        assert!(value.get("tags").is_none());
    }

    #[test]
    fn insert_request_honors_private_preemptible_templates() {
        let mut template = template();
        template.external_access = false;
        template.preemptible = true;
        template.tags = vec!["perf".to_string()];
        let body = build_insert_request("perf-pool-1", &template, "img");
        let value = serde_json::to_value(&body).unwrap();
        assert!(value["networkInterfaces"][0].get("accessConfigs").is_none());
        assert_eq!(value["scheduling"]["preemptible"], true);
        assert_eq!(value["tags"]["items"][0], "perf");
    }

    #[test]
    fn operation_statuses_map_to_typed_states() {
        let done: OperationResource = serde_json::from_str(
            r#"{"name":"op-1","status":"DONE","error":{"errors":[{"code":"QUOTA","message":"out of quota"}]}}"#,
        )
        .unwrap();
        let parsed = parse_operation(done);
        assert_eq!(parsed.status, OperationStatus::Done);
        assert_eq!(parsed.error.as_deref(), Some("QUOTA: out of quota"));

        let pending: OperationResource =
            serde_json::from_str(r#"{"name":"op-2","status":"PENDING"}"#).unwrap();
        assert_eq!(parse_operation(pending).status, OperationStatus::Pending);
    }

    #[test]
    fn instance_resource_translates_to_record() {
        let resource: InstanceResource = serde_json::from_str(
            r#"{
                "name": "perf-client-1",
                "status": "RUNNING",
                "networkInterfaces": [{"networkIP": "10.0.0.7"}],
                "metadata": {"fingerprint": "abc=", "items": [{"key": "ssh-keys", "value": "x"}]}
            }"#,
        )
        .unwrap();
        let record = resource.to_record();
        assert_eq!(record.name, "perf-client-1");
        assert_eq!(record.network_address, "10.0.0.7");
        assert!(record.status.is_running());

        let stopped: InstanceResource =
            serde_json::from_str(r#"{"name":"i","status":"TERMINATED"}"#).unwrap();
        assert_eq!(
            stopped.to_record().status,
            InstanceStatus::Other("TERMINATED".to_string())
        );
    }
}

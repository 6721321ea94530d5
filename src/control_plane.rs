//! # Control Plane Client
//!
//! Generic object CRUD against the load-balancer controller's REST API.
//! Objects are addressed by type name (`cloud`, `pool`, `virtualservice`,
//! `serviceengine`, ...) and the bodies stay as JSON values: the controller's
//! resource model is its own concern, this tool only upserts into it and
//! polls list endpoints for readiness.
//!
//! Responses carry their HTTP status; a non-2xx is data for the caller to
//! log, not an `Err`. Only transport failures surface as errors.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        ControlPlaneError::Transport(err.to_string())
    }
}

/// HTTP-status-bearing response from the controller
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status < 300
    }
}

/// Object CRUD surface of the load-balancer controller
#[async_trait]
pub trait ControlPlaneApi: Send + Sync {
    /// Fetch a single object by its `name` field, `None` when absent
    async fn get_object_by_name(
        &self,
        object_type: &str,
        name: &str,
    ) -> Result<Option<Value>, ControlPlaneError>;

    /// Fetch the full collection for an object type
    async fn get_list(&self, object_type: &str) -> Result<ApiResponse, ControlPlaneError>;

    async fn post_object(
        &self,
        object_type: &str,
        body: &Value,
    ) -> Result<ApiResponse, ControlPlaneError>;

    /// PUT to an object path such as `cloud/<uuid>`
    async fn put_path(&self, path: &str, body: &Value) -> Result<ApiResponse, ControlPlaneError>;

    /// Delete an object by name, resolving its uuid first.
    /// Returns a 404 response when no such object exists.
    async fn delete_by_name(
        &self,
        object_type: &str,
        name: &str,
    ) -> Result<ApiResponse, ControlPlaneError>;
}

/// reqwest-backed controller session with basic auth and a tenant header
pub struct RestControlPlane {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    tenant: String,
}

impl RestControlPlane {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        tenant: impl Into<String>,
    ) -> Result<Self, ControlPlaneError> {
        let http = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            tenant: tenant.into(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/api/{}", self.base_url, path);
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .header("X-Avi-Tenant", &self.tenant)
    }

    async fn into_response(response: reqwest::Response) -> Result<ApiResponse, ControlPlaneError> {
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(ApiResponse { status, body })
    }
}

#[async_trait]
impl ControlPlaneApi for RestControlPlane {
    async fn get_object_by_name(
        &self,
        object_type: &str,
        name: &str,
    ) -> Result<Option<Value>, ControlPlaneError> {
        let response = self
            .request(reqwest::Method::GET, object_type)
            .query(&[("name", name)])
            .send()
            .await?;
        let response = Self::into_response(response).await?;
        if !response.is_success() {
            debug!("get {object_type}/{name} returned {}", response.status);
            return Ok(None);
        }
        Ok(response
            .body
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .cloned())
    }

    async fn get_list(&self, object_type: &str) -> Result<ApiResponse, ControlPlaneError> {
        let response = self
            .request(reqwest::Method::GET, object_type)
            .send()
            .await?;
        Self::into_response(response).await
    }

    async fn post_object(
        &self,
        object_type: &str,
        body: &Value,
    ) -> Result<ApiResponse, ControlPlaneError> {
        let response = self
            .request(reqwest::Method::POST, object_type)
            .json(body)
            .send()
            .await?;
        Self::into_response(response).await
    }

    async fn put_path(&self, path: &str, body: &Value) -> Result<ApiResponse, ControlPlaneError> {
        let response = self
            .request(reqwest::Method::PUT, path)
            .json(body)
            .send()
            .await?;
        Self::into_response(response).await
    }

    async fn delete_by_name(
        &self,
        object_type: &str,
        name: &str,
    ) -> Result<ApiResponse, ControlPlaneError> {
        let Some(object) = self.get_object_by_name(object_type, name).await? else {
            return Ok(ApiResponse {
                status: 404,
                body: Value::Null,
            });
        };
        let uuid = object
            .get("uuid")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string();
        let response = self
            .request(reqwest::Method::DELETE, &format!("{object_type}/{uuid}"))
            .send()
            .await?;
        Self::into_response(response).await
    }
}

//! # Compute Provider
//!
//! Abstract interface for the cloud compute backend plus the typed records
//! the reconciliation engine works with.
//!
//! Raw provider responses are translated into these records by the adapter
//! implementations (see [`gcp`]); the engine itself never touches untyped
//! JSON. Every method returns an explicit [`ProviderError`] so callers decide
//! their own retry policy instead of errors being absorbed inside the call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::InstanceTemplate;

pub mod gcp;

#[cfg(test)]
pub mod fake;

/// Project/zone scope every provider call operates in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub project: String,
    pub zone: String,
}

impl Scope {
    pub fn new(project: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
        }
    }
}

/// Lifecycle state of an instance as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    /// Any non-running state, preserved verbatim for logging
    Other(String),
}

impl InstanceStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }
}

/// Immutable snapshot of one instance from a provider listing.
///
/// Never cached across calls; every reconciliation re-lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub name: String,
    /// Internal network address used for SSH fan-out and pool membership
    pub network_address: String,
    pub status: InstanceStatus,
}

/// One key/value entry of an instance's metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

impl MetadataItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Instance metadata together with the provider's version token.
///
/// The fingerprint must be read immediately before a metadata write and
/// submitted with it so the provider can reject a stale update.
#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    pub fingerprint: String,
    pub items: Vec<MetadataItem>,
}

/// Terminal/transient state of a long-running provider operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
}

/// Read-only reflection of an async provider operation
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    pub status: OperationStatus,
    /// Set when the operation finished but the underlying mutation failed
    pub error: Option<String>,
}

/// Correlation token attached to each batched create sub-request.
///
/// Carried as opaque JSON through the batch machinery so the per-item
/// completion handling can act without shared mutable closures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateToken {
    pub name: String,
    pub zone: String,
    pub project: String,
    pub ssh_user: String,
    pub ssh_key: String,
}

/// One create sub-request inside a batch submission
#[derive(Debug, Clone)]
pub struct BatchCreateRequest {
    pub name: String,
    pub template: InstanceTemplate,
    /// JSON-encoded [`CreateToken`]
    pub token: String,
}

/// Per-item completion delivered by the batch fan-out, order not guaranteed
#[derive(Debug)]
pub struct BatchItemOutcome {
    /// The sub-request's correlation token, verbatim
    pub token: String,
    pub result: Result<Operation, ProviderError>,
}

/// Callback invoked once per batch sub-request as results arrive.
///
/// Implementations must be safe to call from concurrently completing
/// sub-requests; any state they touch has to be atomic or lock-guarded.
pub type BatchCallback<'a> = &'a (dyn Fn(BatchItemOutcome) + Send + Sync);

/// Errors surfaced by provider adapters
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    /// Optimistic-concurrency rejection of a metadata write
    #[error("stale metadata fingerprint for instance {0}")]
    StaleFingerprint(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("instance {0} not found")]
    NotFound(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

/// Compute backend the reconciliation engine drives.
///
/// Mutating calls return an [`Operation`] handle that can be polled with
/// [`crate::poll::wait_for_operation`]; none of them block on completion.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// List all instances in scope, whatever their status
    async fn list_instances(&self, scope: &Scope) -> Result<Vec<InstanceRecord>, ProviderError>;

    /// Read one instance's current metadata and fingerprint
    async fn get_instance_metadata(
        &self,
        scope: &Scope,
        name: &str,
    ) -> Result<InstanceMetadata, ProviderError>;

    async fn create_instance(
        &self,
        scope: &Scope,
        name: &str,
        template: &InstanceTemplate,
    ) -> Result<Operation, ProviderError>;

    async fn delete_instance(&self, scope: &Scope, name: &str)
        -> Result<Operation, ProviderError>;

    async fn get_operation(&self, scope: &Scope, name: &str) -> Result<Operation, ProviderError>;

    /// Replace the instance's metadata items under optimistic concurrency.
    /// Fails with [`ProviderError::StaleFingerprint`] if the fingerprint no
    /// longer matches the provider's current version token.
    async fn set_instance_metadata(
        &self,
        scope: &Scope,
        name: &str,
        fingerprint: &str,
        items: &[MetadataItem],
    ) -> Result<Operation, ProviderError>;

    /// Submit a batch of create sub-requests, invoking `on_complete` once per
    /// sub-request as results arrive. An `Err` means the submission itself
    /// failed before any sub-request ran; per-item failures are delivered
    /// through the callback.
    async fn submit_batch(
        &self,
        scope: &Scope,
        requests: Vec<BatchCreateRequest>,
        on_complete: BatchCallback<'_>,
    ) -> Result<(), ProviderError>;
}

//! In-memory compute provider used by unit tests.
//!
//! Keeps the whole backend behind one mutex so tests can seed instances,
//! inject failures, and assert on call counts.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::InstanceTemplate;
use crate::provider::{
    BatchCallback, BatchCreateRequest, BatchItemOutcome, ComputeProvider, InstanceMetadata,
    InstanceRecord, InstanceStatus, MetadataItem, Operation, OperationStatus, ProviderError, Scope,
};

#[derive(Debug, Clone)]
pub struct FakeInstance {
    pub name: String,
    pub address: String,
    pub status: InstanceStatus,
    pub fingerprint: String,
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub instances: Vec<FakeInstance>,
    pub create_calls: usize,
    pub delete_calls: usize,
    pub metadata_writes: usize,
    pub batch_submissions: usize,
    /// Names whose create call should fail with a transport error
    pub fail_create_names: HashSet<String>,
    /// Names whose next metadata write is rejected as stale (one-shot)
    pub stale_metadata_names: HashSet<String>,
    /// Fail this many whole batch submissions before succeeding
    pub failing_batch_submissions: usize,
    pub operation_polls: usize,
    /// Fail this many operation polls with a transport error
    pub operation_poll_failures: usize,
    pub operations_never_finish: bool,
    pub operation_error: Option<String>,
    /// When set, list_instances fails with a transport error
    pub listing_fails: bool,
}

#[derive(Debug, Default)]
pub struct FakeProvider {
    pub state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_running(names: &[&str]) -> Self {
        let provider = Self::new();
        {
            let mut state = provider.state.lock().unwrap();
            for (index, name) in names.iter().enumerate() {
                state.instances.push(FakeInstance {
                    name: name.to_string(),
                    address: format!("10.0.0.{}", index + 1),
                    status: InstanceStatus::Running,
                    fingerprint: "fp-0".to_string(),
                    items: Vec::new(),
                });
            }
        }
        provider
    }

    fn done_operation(name: impl Into<String>) -> Operation {
        Operation {
            name: name.into(),
            status: OperationStatus::Done,
            error: None,
        }
    }
}

#[async_trait]
impl ComputeProvider for FakeProvider {
    async fn list_instances(&self, _scope: &Scope) -> Result<Vec<InstanceRecord>, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.listing_fails {
            return Err(ProviderError::Transport("listing unavailable".to_string()));
        }
        Ok(state
            .instances
            .iter()
            .map(|inst| InstanceRecord {
                name: inst.name.clone(),
                network_address: inst.address.clone(),
                status: inst.status.clone(),
            })
            .collect())
    }

    async fn get_instance_metadata(
        &self,
        _scope: &Scope,
        name: &str,
    ) -> Result<InstanceMetadata, ProviderError> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .iter()
            .find(|inst| inst.name == name)
            .map(|inst| InstanceMetadata {
                fingerprint: inst.fingerprint.clone(),
                items: inst.items.clone(),
            })
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))
    }

    async fn create_instance(
        &self,
        _scope: &Scope,
        name: &str,
        _template: &InstanceTemplate,
    ) -> Result<Operation, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        if state.fail_create_names.contains(name) {
            return Err(ProviderError::Transport(format!(
                "create {name} rejected"
            )));
        }
        let address = format!("10.0.0.{}", state.instances.len() + 1);
        state.instances.push(FakeInstance {
            name: name.to_string(),
            address,
            status: InstanceStatus::Running,
            fingerprint: "fp-0".to_string(),
            items: Vec::new(),
        });
        Ok(Self::done_operation(format!("op-create-{name}")))
    }

    async fn delete_instance(
        &self,
        _scope: &Scope,
        name: &str,
    ) -> Result<Operation, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls += 1;
        state.instances.retain(|inst| inst.name != name);
        Ok(Self::done_operation(format!("op-delete-{name}")))
    }

    async fn get_operation(&self, _scope: &Scope, name: &str) -> Result<Operation, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.operation_polls += 1;
        if state.operation_poll_failures > 0 {
            state.operation_poll_failures -= 1;
            return Err(ProviderError::Transport("poll unavailable".to_string()));
        }
        if state.operations_never_finish {
            return Ok(Operation {
                name: name.to_string(),
                status: OperationStatus::Running,
                error: None,
            });
        }
        Ok(Operation {
            name: name.to_string(),
            status: OperationStatus::Done,
            error: state.operation_error.clone(),
        })
    }

    async fn set_instance_metadata(
        &self,
        _scope: &Scope,
        name: &str,
        fingerprint: &str,
        items: &[MetadataItem],
    ) -> Result<Operation, ProviderError> {
        let mut state = self.state.lock().unwrap();
        if state.stale_metadata_names.remove(name) {
            return Err(ProviderError::StaleFingerprint(name.to_string()));
        }
        let inst = state
            .instances
            .iter_mut()
            .find(|inst| inst.name == name)
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))?;
        if inst.fingerprint != fingerprint {
            return Err(ProviderError::StaleFingerprint(name.to_string()));
        }
        inst.items = items.to_vec();
        inst.fingerprint = format!("{fingerprint}+");
        state.metadata_writes += 1;
        Ok(Self::done_operation(format!("op-metadata-{name}")))
    }

    async fn submit_batch(
        &self,
        scope: &Scope,
        requests: Vec<BatchCreateRequest>,
        on_complete: BatchCallback<'_>,
    ) -> Result<(), ProviderError> {
        {
            let mut state = self.state.lock().unwrap();
            state.batch_submissions += 1;
            if state.failing_batch_submissions > 0 {
                state.failing_batch_submissions -= 1;
                return Err(ProviderError::Transport(
                    "batch submission unavailable".to_string(),
                ));
            }
        }
        for request in requests {
            let result = self
                .create_instance(scope, &request.name, &request.template)
                .await;
            on_complete(BatchItemOutcome {
                token: request.token,
                result,
            });
        }
        Ok(())
    }
}

//! # Fleet Reconciliation
//!
//! Drives a named instance group toward a desired count. A group is the set
//! of instances sharing a name prefix with a numeric suffix; membership is
//! derived purely from the prefix at read time, there is no persisted group
//! identity.
//!
//! `reconcile` is the sole entry point and is idempotent: it re-lists, closes
//! the shortfall (one create call per instance or one batched submission),
//! injects SSH trust material, and returns the authoritative re-listed set.
//! Partial fulfilment is not an error; the caller compares achieved count to
//! desired count.
//!
//! Concurrent reconciliations of the same prefix may both pick the same next
//! suffix; the provider-side name collision fails one of the creates and the
//! loser's shortfall is picked up by its final re-list. There is no
//! cross-process lock.

use tracing::{debug, error, info, warn};

use crate::config::InstanceTemplate;
use crate::metadata::merge_ssh_key;
use crate::poll::{wait_for_operation, PollConfig};
use crate::provider::{ComputeProvider, InstanceRecord, Operation, Scope};

pub mod batch;

use batch::BatchCoordinator;

/// How the shortfall is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateMode {
    /// One create call per instance; optionally poll each operation
    Sync { wait: bool },
    /// One batched submission for the whole shortfall
    Async,
}

/// Input to one reconciliation pass; never persisted
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    pub group_prefix: String,
    pub desired_count: usize,
    pub template: InstanceTemplate,
    pub ssh_user: String,
    pub ssh_public_key: String,
    pub mode: CreateMode,
}

/// Pure prefix filter over a listing snapshot
pub fn filter_by_prefix(records: &[InstanceRecord], prefix: &str) -> Vec<InstanceRecord> {
    records
        .iter()
        .filter(|record| record.name.starts_with(prefix))
        .cloned()
        .collect()
}

/// Next unused numeric suffix for the group: `max(existing) + 1`.
///
/// A name that does not carry the prefix, or whose remainder is not numeric,
/// violates the group's naming contract; it is logged and excluded from the
/// computation rather than aborting the reconciliation.
pub fn next_suffix(records: &[InstanceRecord], prefix: &str) -> u64 {
    let mut highest = 0;
    for record in records {
        let suffix = record
            .name
            .strip_prefix(prefix)
            .and_then(|remainder| remainder.parse::<u64>().ok());
        match suffix {
            Some(suffix) => highest = highest.max(suffix),
            None => warn!(
                "instance {} does not follow the {prefix}<N> naming contract, ignoring",
                record.name
            ),
        }
    }
    highest + 1
}

/// Reconciles instance groups against the compute provider
pub struct FleetReconciler<'a> {
    provider: &'a dyn ComputeProvider,
    scope: Scope,
    poll: PollConfig,
}

impl<'a> FleetReconciler<'a> {
    pub fn new(provider: &'a dyn ComputeProvider, scope: Scope) -> Self {
        Self {
            provider,
            scope,
            poll: PollConfig::default(),
        }
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// List currently running instances in scope.
    ///
    /// Fails soft: a transport/API error is logged and yields an empty
    /// listing so the caller's reconciliation stays retriable.
    pub async fn list_running(&self) -> Vec<InstanceRecord> {
        match self.provider.list_instances(&self.scope).await {
            Ok(records) => records
                .into_iter()
                .filter(|record| record.status.is_running())
                .collect(),
            Err(err) => {
                error!("error listing instances: {err}");
                Vec::new()
            }
        }
    }

    /// Drive the group toward `desired_count` and return the re-listed group.
    pub async fn reconcile(&self, request: &ProvisioningRequest) -> Vec<InstanceRecord> {
        let group = filter_by_prefix(&self.list_running().await, &request.group_prefix);
        if group.len() >= request.desired_count {
            info!(
                "{} running instances fulfil target {} for prefix {}",
                group.len(),
                request.desired_count,
                request.group_prefix
            );
            return group;
        }

        let shortfall = request.desired_count - group.len();
        let first_suffix = next_suffix(&group, &request.group_prefix);

        match request.mode {
            CreateMode::Sync { wait } => {
                let operations = self.create_sync(request, shortfall, first_suffix).await;
                if wait {
                    for operation in &operations {
                        wait_for_operation(self.provider, &self.scope, operation, &self.poll).await;
                    }
                }
            }
            CreateMode::Async => {
                let coordinator = BatchCoordinator::new(self.provider, &self.scope);
                coordinator.create_batch(request, shortfall, first_suffix).await;
            }
        }

        // Trust material goes in only after an instance is confirmed to
        // exist; both create modes share this single merge pass.
        let observed = filter_by_prefix(&self.list_running().await, &request.group_prefix);
        for instance in &observed {
            inject_ssh_key(
                self.provider,
                &self.scope,
                &instance.name,
                &request.ssh_user,
                &request.ssh_public_key,
            )
            .await;
        }

        let achieved = filter_by_prefix(&self.list_running().await, &request.group_prefix);
        info!(
            "{} instances running for prefix {}",
            achieved.len(),
            request.group_prefix
        );
        achieved
    }

    async fn create_sync(
        &self,
        request: &ProvisioningRequest,
        shortfall: usize,
        first_suffix: u64,
    ) -> Vec<Operation> {
        let mut operations = Vec::with_capacity(shortfall);
        for offset in 0..shortfall {
            let name = format!("{}{}", request.group_prefix, first_suffix + offset as u64);
            info!("creating instance {name}");
            match self
                .provider
                .create_instance(&self.scope, &name, &request.template)
                .await
            {
                Ok(operation) => operations.push(operation),
                // Partial success is acceptable; the final re-list reveals
                // the true count.
                Err(err) => error!("error creating instance {name}: {err}"),
            }
        }
        operations
    }

    /// Delete every group member, optionally waiting on each operation.
    /// Returns the number of delete calls issued.
    pub async fn delete_group(&self, prefix: &str, wait: bool) -> usize {
        let group = filter_by_prefix(&self.list_running().await, prefix);
        let mut operations = Vec::with_capacity(group.len());
        for instance in &group {
            info!("deleting instance {}", instance.name);
            match self.provider.delete_instance(&self.scope, &instance.name).await {
                Ok(operation) => operations.push(operation),
                Err(err) => error!("error deleting instance {}: {err}", instance.name),
            }
        }
        if wait {
            for operation in &operations {
                wait_for_operation(self.provider, &self.scope, operation, &self.poll).await;
            }
        }
        operations.len()
    }
}

/// Merge the SSH public key into one instance's metadata under the current
/// fingerprint. All failure modes are logged and dropped; a stale-fingerprint
/// rejection is retried by the next reconciliation pass, not here.
pub(crate) async fn inject_ssh_key(
    provider: &dyn ComputeProvider,
    scope: &Scope,
    name: &str,
    user: &str,
    public_key: &str,
) {
    let metadata = match provider.get_instance_metadata(scope, name).await {
        Ok(metadata) => metadata,
        Err(err) => {
            error!("error reading metadata for instance {name}: {err}");
            return;
        }
    };

    let (items, changed) = merge_ssh_key(&metadata.items, user, public_key);
    if !changed {
        debug!("ssh key for {user} already present on {name}");
        return;
    }

    if let Err(err) = provider
        .set_instance_metadata(scope, name, &metadata.fingerprint, &items)
        .await
    {
        error!("error updating metadata for instance {name}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SSH_KEYS_KEY;
    use crate::provider::fake::FakeProvider;
    use crate::provider::InstanceStatus;
    use std::time::Duration;

    const PUBLIC_KEY: &str = "ssh-rsa AAAAB3Nza-material bench@host";

    fn template() -> InstanceTemplate {
        serde_yaml::from_str(
            "project: perf-project\nsubnet: regions/us-central1/subnetworks/perf\n",
        )
        .unwrap()
    }

    fn request(prefix: &str, desired: usize, mode: CreateMode) -> ProvisioningRequest {
        ProvisioningRequest {
            group_prefix: prefix.to_string(),
            desired_count: desired,
            template: template(),
            ssh_user: "bench".to_string(),
            ssh_public_key: PUBLIC_KEY.to_string(),
            mode,
        }
    }

    fn reconciler(provider: &FakeProvider) -> FleetReconciler<'_> {
        FleetReconciler::new(provider, Scope::new("perf-project", "us-central1-b"))
            .with_poll_config(PollConfig {
                interval: Duration::from_millis(1),
                max_attempts: 3,
            })
    }

    fn names(records: &[InstanceRecord]) -> Vec<String> {
        let mut names: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn prefix_filter_is_pure() {
        let records = vec![
            InstanceRecord {
                name: "perf-client-1".to_string(),
                network_address: "10.0.0.1".to_string(),
                status: InstanceStatus::Running,
            },
            InstanceRecord {
                name: "perf-pool-1".to_string(),
                network_address: "10.0.0.2".to_string(),
                status: InstanceStatus::Running,
            },
        ];
        let filtered = filter_by_prefix(&records, "perf-client-");
        assert_eq!(names(&filtered), vec!["perf-client-1"]);
    }

    #[test]
    fn suffixes_never_reuse_gaps() {
        let records: Vec<InstanceRecord> = [3, 5, 7]
            .iter()
            .map(|n| InstanceRecord {
                name: format!("perf-client-{n}"),
                network_address: String::new(),
                status: InstanceStatus::Running,
            })
            .collect();
        assert_eq!(next_suffix(&records, "perf-client-"), 8);
    }

    #[test]
    fn non_numeric_suffix_is_excluded_not_fatal() {
        let records = vec![
            InstanceRecord {
                name: "perf-client-canary".to_string(),
                network_address: String::new(),
                status: InstanceStatus::Running,
            },
            InstanceRecord {
                name: "perf-client-2".to_string(),
                network_address: String::new(),
                status: InstanceStatus::Running,
            },
        ];
        assert_eq!(next_suffix(&records, "perf-client-"), 3);
    }

    #[test]
    fn unmatched_names_are_ignored_not_a_panic() {
        let records = vec![
            InstanceRecord {
                name: "db".to_string(),
                network_address: String::new(),
                status: InstanceStatus::Running,
            },
            InstanceRecord {
                name: "perf-client-4".to_string(),
                network_address: String::new(),
                status: InstanceStatus::Running,
            },
        ];
        assert_eq!(next_suffix(&records, "perf-client-"), 5);
    }

    #[tokio::test]
    async fn satisfied_group_triggers_no_creates() {
        let provider =
            FakeProvider::with_running(&["perf-client-1", "perf-client-2", "perf-client-3"]);
        let achieved = reconciler(&provider)
            .reconcile(&request("perf-client-", 3, CreateMode::Sync { wait: false }))
            .await;
        assert_eq!(achieved.len(), 3);
        assert_eq!(provider.state.lock().unwrap().create_calls, 0);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let provider = FakeProvider::with_running(&["perf-client-1"]);
        let engine = reconciler(&provider);
        let req = request("perf-client-", 3, CreateMode::Sync { wait: false });

        let first = engine.reconcile(&req).await;
        let creates_after_first = provider.state.lock().unwrap().create_calls;
        let second = engine.reconcile(&req).await;

        assert_eq!(creates_after_first, 2);
        assert_eq!(provider.state.lock().unwrap().create_calls, 2);
        assert_eq!(names(&first), names(&second));
    }

    #[tokio::test]
    async fn closes_shortfall_with_monotonic_suffixes() {
        let provider = FakeProvider::with_running(&["perf-client-1"]);
        let achieved = reconciler(&provider)
            .reconcile(&request("perf-client-", 3, CreateMode::Sync { wait: true }))
            .await;
        assert_eq!(
            names(&achieved),
            vec!["perf-client-1", "perf-client-2", "perf-client-3"]
        );
    }

    #[tokio::test]
    async fn gaps_are_not_reused_when_creating() {
        let provider = FakeProvider::with_running(&["perf-client-3", "perf-client-5", "perf-client-7"]);
        let achieved = reconciler(&provider)
            .reconcile(&request("perf-client-", 5, CreateMode::Sync { wait: false }))
            .await;
        assert_eq!(
            names(&achieved),
            vec![
                "perf-client-3",
                "perf-client-5",
                "perf-client-7",
                "perf-client-8",
                "perf-client-9"
            ]
        );
    }

    #[tokio::test]
    async fn create_failure_is_partial_not_fatal() {
        let provider = FakeProvider::with_running(&["perf-client-1"]);
        provider
            .state
            .lock()
            .unwrap()
            .fail_create_names
            .insert("perf-client-2".to_string());

        let achieved = reconciler(&provider)
            .reconcile(&request("perf-client-", 3, CreateMode::Sync { wait: false }))
            .await;

        // perf-client-2 failed, perf-client-3 still went through
        assert_eq!(names(&achieved), vec!["perf-client-1", "perf-client-3"]);
        assert_eq!(provider.state.lock().unwrap().create_calls, 2);
    }

    #[tokio::test]
    async fn ssh_key_is_merged_into_created_instances() {
        let provider = FakeProvider::new();
        reconciler(&provider)
            .reconcile(&request("perf-client-", 2, CreateMode::Sync { wait: false }))
            .await;

        let state = provider.state.lock().unwrap();
        assert_eq!(state.metadata_writes, 2);
        for inst in &state.instances {
            let item = inst
                .items
                .iter()
                .find(|item| item.key == SSH_KEYS_KEY)
                .expect("ssh-keys item present");
            assert!(item.value.contains("bench:ssh-rsa AAAAB3Nza-material bench"));
        }
    }

    #[tokio::test]
    async fn rejected_metadata_write_is_absorbed() {
        let provider = FakeProvider::with_running(&["perf-client-1"]);
        provider
            .state
            .lock()
            .unwrap()
            .stale_metadata_names
            .insert("perf-client-2".to_string());

        let achieved = reconciler(&provider)
            .reconcile(&request("perf-client-", 3, CreateMode::Sync { wait: false }))
            .await;

        // The rejected write is dropped, not retried; the pass still
        // finishes and reports the re-listed group.
        assert_eq!(
            names(&achieved),
            vec!["perf-client-1", "perf-client-2", "perf-client-3"]
        );
        assert_eq!(provider.state.lock().unwrap().metadata_writes, 2);
    }

    #[tokio::test]
    async fn async_mode_submits_one_batch_for_the_shortfall() {
        let provider = FakeProvider::with_running(&["perf-client-1"]);
        let achieved = reconciler(&provider)
            .reconcile(&request("perf-client-", 4, CreateMode::Async))
            .await;

        assert_eq!(
            names(&achieved),
            vec![
                "perf-client-1",
                "perf-client-2",
                "perf-client-3",
                "perf-client-4"
            ]
        );
        let state = provider.state.lock().unwrap();
        assert_eq!(state.batch_submissions, 1);
        assert_eq!(state.create_calls, 3);
        // Every member gets the key, pre-existing included
        assert_eq!(state.metadata_writes, 4);
    }

    #[tokio::test]
    async fn listing_failure_yields_empty_inventory() {
        let provider = FakeProvider::with_running(&["perf-client-1"]);
        provider.state.lock().unwrap().listing_fails = true;
        let running = reconciler(&provider).list_running().await;
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn delete_group_only_touches_the_prefix() {
        let provider =
            FakeProvider::with_running(&["perf-client-1", "perf-client-2", "perf-pool-1"]);
        let deleted = reconciler(&provider).delete_group("perf-client-", true).await;
        assert_eq!(deleted, 2);
        let state = provider.state.lock().unwrap();
        assert_eq!(state.instances.len(), 1);
        assert_eq!(state.instances[0].name, "perf-pool-1");
    }
}

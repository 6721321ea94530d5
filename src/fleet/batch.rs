//! # Batch Create Coordinator
//!
//! Builds one batched submission for a whole shortfall and tracks per-item
//! completion. Each sub-request carries a JSON correlation token so the
//! completion callback can act without shared mutable closures; the only
//! shared state is an outstanding counter and the success list, both scoped
//! to a single batch invocation.
//!
//! The submission is retried as a whole on transport failure; individual
//! sub-request failures are not retried and simply yield one fewer instance
//! in the caller's final inventory. The coordinator never returns the
//! created set as ground truth, the reconciler re-lists for that.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::fleet::ProvisioningRequest;
use crate::provider::{
    BatchCreateRequest, BatchItemOutcome, ComputeProvider, CreateToken, Scope,
};

const SUBMIT_ATTEMPTS: u32 = 5;
const SUBMIT_BACKOFF: Duration = Duration::from_secs(3);

pub struct BatchCoordinator<'a> {
    provider: &'a dyn ComputeProvider,
    scope: &'a Scope,
    submit_backoff: Duration,
}

impl<'a> BatchCoordinator<'a> {
    pub fn new(provider: &'a dyn ComputeProvider, scope: &'a Scope) -> Self {
        Self {
            provider,
            scope,
            submit_backoff: SUBMIT_BACKOFF,
        }
    }

    #[cfg(test)]
    fn with_submit_backoff(mut self, backoff: Duration) -> Self {
        self.submit_backoff = backoff;
        self
    }

    /// Submit `shortfall` create sub-requests named from `first_suffix`
    /// upwards. Returns the names the completion callback confirmed created,
    /// for accounting; callers treat their own re-list as ground truth.
    pub async fn create_batch(
        &self,
        request: &ProvisioningRequest,
        shortfall: usize,
        first_suffix: u64,
    ) -> Vec<String> {
        let mut sub_requests = Vec::with_capacity(shortfall);
        for offset in 0..shortfall {
            let name = format!("{}{}", request.group_prefix, first_suffix + offset as u64);
            let token = CreateToken {
                name: name.clone(),
                zone: self.scope.zone.clone(),
                project: self.scope.project.clone(),
                ssh_user: request.ssh_user.clone(),
                ssh_key: request.ssh_public_key.clone(),
            };
            let token = match serde_json::to_string(&token) {
                Ok(token) => token,
                Err(err) => {
                    warn!("unable to encode correlation token for {name}: {err}");
                    continue;
                }
            };
            info!("queueing create for instance {name}");
            sub_requests.push(BatchCreateRequest {
                name,
                template: request.template.clone(),
                token,
            });
        }

        let outstanding = AtomicUsize::new(sub_requests.len());
        let succeeded: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let on_complete = |outcome: BatchItemOutcome| {
            let left = outstanding
                .fetch_sub(1, Ordering::SeqCst)
                .saturating_sub(1);
            if left == 0 {
                info!("all batch sub-requests complete");
            } else {
                info!("{left} batch sub-requests outstanding");
            }
            match outcome.result {
                Err(err) => error!("batch create sub-request failed: {err}"),
                Ok(operation) => {
                    if let Some(message) = operation.error {
                        error!("batch create operation reported error: {message}");
                        return;
                    }
                    succeeded
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(outcome.token);
                }
            }
        };

        for attempt in 1..=SUBMIT_ATTEMPTS {
            match self
                .provider
                .submit_batch(self.scope, sub_requests.clone(), &on_complete)
                .await
            {
                Ok(()) => break,
                Err(err) => {
                    error!("batch submission failed on attempt {attempt}: {err}");
                    if attempt < SUBMIT_ATTEMPTS {
                        sleep(self.submit_backoff).await;
                    }
                }
            }
        }

        let tokens = succeeded
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let created = decode_tokens(tokens);
        info!("{} batch creates confirmed", created.len());
        created.into_iter().map(|token| token.name).collect()
    }
}

/// Decode recorded correlation tokens, skipping any that fail to parse
fn decode_tokens(raw: Vec<String>) -> Vec<CreateToken> {
    let mut tokens = Vec::with_capacity(raw.len());
    for encoded in raw {
        match serde_json::from_str::<CreateToken>(&encoded) {
            Ok(token) => tokens.push(token),
            Err(err) => warn!("unable to decode correlation token {encoded:?}: {err}"),
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::CreateMode;
    use crate::provider::fake::FakeProvider;

    const PUBLIC_KEY: &str = "ssh-rsa AAAAB3Nza-material bench@host";

    fn request(desired: usize) -> ProvisioningRequest {
        ProvisioningRequest {
            group_prefix: "perf-client-".to_string(),
            desired_count: desired,
            template: serde_yaml::from_str(
                "project: perf-project\nsubnet: regions/us-central1/subnetworks/perf\n",
            )
            .unwrap(),
            ssh_user: "bench".to_string(),
            ssh_public_key: PUBLIC_KEY.to_string(),
            mode: CreateMode::Async,
        }
    }

    fn scope() -> Scope {
        Scope::new("perf-project", "us-central1-b")
    }

    #[tokio::test]
    async fn one_submission_covers_the_whole_shortfall() {
        let provider = FakeProvider::with_running(&["perf-client-1"]);
        let scope = scope();
        let created = BatchCoordinator::new(&provider, &scope)
            .create_batch(&request(4), 3, 2)
            .await;

        let state = provider.state.lock().unwrap();
        assert_eq!(state.batch_submissions, 1);
        assert_eq!(state.create_calls, 3);
        assert_eq!(
            created,
            vec!["perf-client-2", "perf-client-3", "perf-client-4"]
        );
    }

    #[tokio::test]
    async fn submission_is_retried_on_transport_failure() {
        let provider = FakeProvider::new();
        provider.state.lock().unwrap().failing_batch_submissions = 2;
        let scope = scope();
        let created = BatchCoordinator::new(&provider, &scope)
            .with_submit_backoff(Duration::from_millis(1))
            .create_batch(&request(2), 2, 1)
            .await;

        let state = provider.state.lock().unwrap();
        assert_eq!(state.batch_submissions, 3);
        assert_eq!(created.len(), 2);
    }

    #[tokio::test]
    async fn submission_gives_up_after_five_attempts() {
        let provider = FakeProvider::new();
        provider.state.lock().unwrap().failing_batch_submissions = 5;
        let scope = scope();
        let created = BatchCoordinator::new(&provider, &scope)
            .with_submit_backoff(Duration::from_millis(1))
            .create_batch(&request(2), 2, 1)
            .await;

        let state = provider.state.lock().unwrap();
        assert_eq!(state.batch_submissions, 5);
        assert!(state.instances.is_empty());
        assert!(created.is_empty());
    }

    #[tokio::test]
    async fn failed_sub_request_yields_one_fewer_instance() {
        let provider = FakeProvider::new();
        provider
            .state
            .lock()
            .unwrap()
            .fail_create_names
            .insert("perf-client-2".to_string());
        let scope = scope();
        let created = BatchCoordinator::new(&provider, &scope)
            .create_batch(&request(3), 3, 1)
            .await;

        assert_eq!(created, vec!["perf-client-1", "perf-client-3"]);
        assert_eq!(provider.state.lock().unwrap().instances.len(), 2);
    }

    #[test]
    fn malformed_tokens_are_skipped() {
        let valid = serde_json::to_string(&CreateToken {
            name: "perf-client-1".to_string(),
            zone: "us-central1-b".to_string(),
            project: "perf-project".to_string(),
            ssh_user: "bench".to_string(),
            ssh_key: PUBLIC_KEY.to_string(),
        })
        .unwrap();
        let tokens = decode_tokens(vec![valid, "not-json".to_string()]);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].name, "perf-client-1");
    }
}

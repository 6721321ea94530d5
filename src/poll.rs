//! # Bounded Polling
//!
//! Two sleep-and-retry loops with hard attempt ceilings: one for async
//! provider operations, one generic loop for dependent-resource readiness.
//!
//! Neither ever blocks indefinitely; a poll runs to terminal success or its
//! ceiling, and abandonment is a soft timeout the caller absorbs.

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::provider::{ComputeProvider, Operation, OperationStatus, Scope};

/// Interval and ceiling for operation polling (~200s wall clock by default)
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(4),
            max_attempts: 50,
        }
    }
}

/// Terminal result of waiting on a provider operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Operation reached DONE with no embedded error
    Done,
    /// Operation reached DONE but the underlying mutation failed
    Failed(String),
    /// Attempt ceiling exhausted; the caller proceeds without the result
    Abandoned,
}

/// Poll `operation` until it is DONE or the attempt ceiling is reached.
///
/// Transport errors while polling are logged and retried after one interval;
/// they count toward the ceiling. A DONE operation with an embedded error is
/// reported as [`PollOutcome::Failed`] but never raised.
pub async fn wait_for_operation(
    provider: &dyn ComputeProvider,
    scope: &Scope,
    operation: &Operation,
    config: &PollConfig,
) -> PollOutcome {
    info!("waiting for operation {} to finish", operation.name);
    for attempt in 0..config.max_attempts {
        if attempt > 0 {
            sleep(config.interval).await;
        }
        match provider.get_operation(scope, &operation.name).await {
            Err(err) => {
                warn!("error polling operation {}: {err}", operation.name);
            }
            Ok(current) => match current.status {
                OperationStatus::Done => {
                    if let Some(message) = current.error {
                        error!("operation {} failed: {message}", operation.name);
                        return PollOutcome::Failed(message);
                    }
                    info!("operation {} done", operation.name);
                    return PollOutcome::Done;
                }
                status => {
                    debug!("operation {} status {status:?}", operation.name);
                }
            },
        }
    }
    warn!("abandoning operation {}", operation.name);
    PollOutcome::Abandoned
}

/// Interval and ceiling for dependent-resource readiness (~300s by default)
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 60,
        }
    }
}

/// Wait until at least `target` queried items are ready, accumulating a
/// stable key per ready item.
///
/// `target == 0` flips the polarity: the loop waits for the queried list to
/// drain to empty. Either way the accumulated set is returned when the
/// ceiling is exhausted; a short set is not an error, the caller compares
/// its size against the target.
pub async fn wait_for_ready<T, K, E, Q, Fut>(
    mut query: Q,
    is_ready: impl Fn(&T) -> bool,
    extract_key: impl Fn(&T) -> K,
    target: usize,
    config: &ReadinessConfig,
) -> HashSet<K>
where
    K: Eq + Hash,
    E: Display,
    Q: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
{
    let mut ready = HashSet::new();
    for attempt in 0..config.max_attempts {
        if attempt > 0 {
            sleep(config.interval).await;
        }
        let items = match query().await {
            Ok(items) => items,
            Err(err) => {
                warn!("readiness query failed: {err}");
                break;
            }
        };

        if target == 0 {
            if items.is_empty() {
                break;
            }
            info!("{} items remain, waiting for drain", items.len());
        } else {
            for item in &items {
                if is_ready(item) {
                    ready.insert(extract_key(item));
                }
            }
            if ready.len() >= target {
                break;
            }
            info!(
                "readiness target not reached, {} of {target} ready ({} items listed)",
                ready.len(),
                items.len()
            );
        }
    }
    ready
}

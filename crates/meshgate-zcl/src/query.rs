//! Descriptor queries with bounded retries
//!
//! Discovery steps need certainty, so each one is attempted a fixed number
//! of times with its own per-attempt deadline.

use meshgate_core::{Endpoint, EndpointDescriptor, Node, NodeDescriptor};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::transport::{with_deadline, Transport, TransportError, DEFAULT_TIMEOUT_MS};

/// Pause between failed attempts
const RETRY_DELAY_MS: u64 = 100;

/// How often and how long to try one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Run `operation` until it succeeds or the attempts are used up.
///
/// Returns the last error when every attempt failed.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = TransportError::Timeout(policy.attempt_timeout);

    for attempt in 1..=attempts {
        match with_deadline(policy.attempt_timeout, attempt_fn()).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(operation, attempt, attempts, error = %e, "Attempt failed");
                last_error = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
        }
    }

    Err(last_error)
}

pub async fn query_node_descriptor(
    transport: &dyn Transport,
    node: &Node,
    policy: RetryPolicy,
) -> Result<NodeDescriptor, TransportError> {
    retry(policy, "node descriptor", || transport.node_descriptor(node)).await
}

pub async fn query_active_endpoints(
    transport: &dyn Transport,
    node: &Node,
    policy: RetryPolicy,
) -> Result<Vec<Endpoint>, TransportError> {
    retry(policy, "active endpoints", || transport.active_endpoints(node)).await
}

pub async fn query_simple_descriptor(
    transport: &dyn Transport,
    node: &Node,
    endpoint: Endpoint,
    policy: RetryPolicy,
) -> Result<EndpointDescriptor, TransportError> {
    retry(policy, "simple descriptor", || {
        transport.simple_descriptor(node, endpoint)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            attempt_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry(fast_policy(3), "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TransportError::NoAck)
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry(fast_policy(2), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::NoAck)
        })
        .await;
        assert!(matches!(result, Err(TransportError::NoAck)));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_times_out_each_attempt() {
        let result: Result<(), _> = retry(fast_policy(2), "test", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }
}

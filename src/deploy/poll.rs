//! Polling the node until it converges
//!
//! Ironic transitions are asynchronous: a provision state request only
//! starts the work. A wait re-reads the node at a fixed interval until it
//! reaches the awaited state, treating the known in-progress states as
//! "keep waiting" and anything else as failure. Each wait is bounded by a
//! timeout and can be cancelled.

use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::DeploymentState;
use crate::config::PollingSettings;
use crate::ironic::{NodeClient, ProvisionState};
use crate::DeployError;

/// Default delay between two polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default upper bound on a single wait
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

/// How waits poll the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    /// `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: Some(DEFAULT_WAIT_TIMEOUT),
        }
    }
}

impl PollOptions {
    pub fn new(interval: Duration, timeout: Option<Duration>) -> Self {
        Self { interval, timeout }
    }
}

impl From<&PollingSettings> for PollOptions {
    fn from(settings: &PollingSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            timeout: match settings.timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

/// Polls one node on behalf of a deployment
pub(crate) struct Poller<'a> {
    pub client: &'a dyn NodeClient,
    pub node_id: &'a str,
    pub options: &'a PollOptions,
    pub cancel: &'a CancellationToken,
}

impl Poller<'_> {
    /// Wait until the node reaches the state `state` awaits
    ///
    /// `on_pending` runs after every poll that saw an in-progress state.
    /// A failed get ends the wait immediately.
    pub async fn wait<F>(&self, state: DeploymentState, mut on_pending: F) -> Result<(), DeployError>
    where
        F: FnMut(&ProvisionState) + Send,
    {
        let Some(expected) = state.awaited() else {
            return Ok(());
        };
        let started = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return Err(DeployError::Cancelled(self.node_id.to_string()));
            }

            let node = self.client.get_node(self.node_id).await?;
            let observed = node.provision_state;

            if observed == expected {
                debug!("Node {} reached '{}'", self.node_id, expected);
                return Ok(());
            }

            if !state.is_in_progress(&observed) {
                if let Some(last_error) = &node.last_error {
                    warn!("Node {} last error: {}", self.node_id, last_error);
                }
                return Err(DeployError::UnexpectedState {
                    node: self.node_id.to_string(),
                    expected,
                    state: observed,
                });
            }

            debug!(
                "Node {} is '{}', waiting for '{}'",
                self.node_id, observed, expected
            );
            on_pending(&observed);

            let elapsed = started.elapsed();
            let delay = match self.options.timeout {
                Some(timeout) if elapsed >= timeout => {
                    return Err(DeployError::Timeout {
                        node: self.node_id.to_string(),
                        expected,
                        waited: elapsed,
                    });
                }
                Some(timeout) => self.options.interval.min(timeout - elapsed),
                None => self.options.interval,
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(DeployError::Cancelled(self.node_id.to_string()));
                }
                _ = sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ironic::ProvisionTarget;
    use crate::ironic::mock::MockNodeClient;

    fn fast() -> PollOptions {
        PollOptions::new(Duration::from_millis(1), Some(Duration::from_secs(5)))
    }

    async fn wait(
        mock: &MockNodeClient,
        state: DeploymentState,
        options: &PollOptions,
        cancel: &CancellationToken,
    ) -> (Result<(), DeployError>, usize) {
        let poller = Poller {
            client: mock,
            node_id: "n1",
            options,
            cancel,
        };
        let mut pending = 0;
        let result = poller.wait(state, |_| pending += 1).await;
        (result, pending)
    }

    #[tokio::test]
    async fn test_wait_converges() {
        let mock = MockNodeClient::new()
            .with_node("n1", "manageable")
            .with_transition("n1", ProvisionTarget::Provide, ["cleaning", "cleaning", "available"]);
        mock.change_provision_state("n1", ProvisionTarget::Provide, None)
            .await
            .unwrap();

        let (result, pending) = wait(
            &mock,
            DeploymentState::WaitProvide,
            &fast(),
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(pending, 2);
    }

    #[tokio::test]
    async fn test_wait_unexpected_state() {
        let mock = MockNodeClient::new().with_node("n1", "enroll");

        let (result, pending) = wait(
            &mock,
            DeploymentState::WaitManage,
            &fast(),
            &CancellationToken::new(),
        )
        .await;

        match result {
            Err(DeployError::UnexpectedState {
                expected, state, ..
            }) => {
                assert_eq!(expected, ProvisionState::Manageable);
                assert_eq!(state, ProvisionState::Enroll);
            }
            other => panic!("Expected UnexpectedState, got {:?}", other),
        }
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_wait_get_failure_ends_wait() {
        let mock = MockNodeClient::new()
            .with_node("n1", "verifying")
            .with_get_error_after("n1", 2, "connection refused");

        let (result, pending) = wait(
            &mock,
            DeploymentState::WaitManage,
            &fast(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(DeployError::Transport { .. })));
        assert_eq!(pending, 2);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mock = MockNodeClient::new().with_node("n1", "verifying");
        let options = PollOptions::new(Duration::from_millis(5), Some(Duration::from_millis(30)));

        let (result, _) = wait(
            &mock,
            DeploymentState::WaitManage,
            &options,
            &CancellationToken::new(),
        )
        .await;

        match result {
            Err(DeployError::Timeout { expected, waited, .. }) => {
                assert_eq!(expected, ProvisionState::Manageable);
                assert!(waited >= Duration::from_millis(30));
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_cancelled_while_sleeping() {
        let mock = MockNodeClient::new().with_node("n1", "cleaning");
        let options = PollOptions::new(Duration::from_secs(60), None);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let (result, pending) = wait(&mock, DeploymentState::WaitProvide, &options, &cancel).await;
        assert_eq!(result, Err(DeployError::Cancelled("n1".to_string())));
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn test_wait_cancelled_before_polling() {
        let mock = MockNodeClient::new().with_node("n1", "active");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (result, _) = wait(&mock, DeploymentState::WaitDeploy, &fast(), &cancel).await;
        assert!(matches!(result, Err(DeployError::Cancelled(_))));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_options_from_settings() {
        let settings = PollingSettings {
            interval_secs: 2,
            timeout_secs: 0,
        };
        let options = PollOptions::from(&settings);
        assert_eq!(options.interval, Duration::from_secs(2));
        assert_eq!(options.timeout, None);

        assert_eq!(PollOptions::default().interval, DEFAULT_POLL_INTERVAL);
    }
}

//! Mock node client for testing
//!
//! Replays scripted provision states per node and records every call, so
//! deployments can be exercised without a running Ironic.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{Node, NodeClient, PatchOperation, ProvisionState, ProvisionTarget};
use crate::DeployError;

/// A call received by the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Get {
        node: String,
    },
    ChangeState {
        node: String,
        target: ProvisionTarget,
        config_drive: Option<String>,
    },
    Patch {
        node: String,
        operations: Vec<PatchOperation>,
    },
}

impl MockCall {
    /// Node the call was made for
    pub fn node(&self) -> &str {
        match self {
            Self::Get { node } | Self::ChangeState { node, .. } | Self::Patch { node, .. } => {
                node.as_str()
            }
        }
    }
}

#[derive(Debug, Default)]
struct MockNode {
    current: Option<ProvisionState>,
    pending: VecDeque<ProvisionState>,
    transitions: HashMap<ProvisionTarget, Vec<ProvisionState>>,
    state_change_errors: HashMap<ProvisionTarget, String>,
    patch_error: Option<String>,
    /// Fail every get after this many successful ones
    get_error: Option<(usize, String)>,
    gets: usize,
}

impl MockNode {
    /// Advance one step along the scripted states; the last one sticks
    fn observe(&mut self) -> ProvisionState {
        if let Some(next) = self.pending.pop_front() {
            self.current = Some(next);
        }
        self.current.clone().unwrap_or(ProvisionState::Enroll)
    }
}

#[derive(Debug, Default)]
struct MockState {
    nodes: HashMap<String, MockNode>,
    calls: Vec<MockCall>,
}

/// Mock bare metal service
///
/// # Example
/// ```
/// use baremetal_deploy::ironic::mock::MockNodeClient;
/// use baremetal_deploy::ironic::{ProvisionState, ProvisionTarget};
///
/// let mock = MockNodeClient::new()
///     .with_node("node-1", ProvisionState::Enroll)
///     .with_transition("node-1", ProvisionTarget::Manage, ["verifying", "manageable"]);
/// ```
#[derive(Debug, Default)]
pub struct MockNodeClient {
    state: Mutex<MockState>,
}

impl MockNodeClient {
    /// Create a mock that knows no nodes
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn node_mut(&mut self, node_id: &str) -> &mut MockNode {
        self.state
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .nodes
            .entry(node_id.to_string())
            .or_default()
    }

    /// Register a node in an initial provision state
    pub fn with_node(mut self, node_id: &str, state: impl Into<ProvisionState>) -> Self {
        self.node_mut(node_id).current = Some(state.into());
        self
    }

    /// States reported by successive gets after `target` is requested
    pub fn with_transition<I, S>(mut self, node_id: &str, target: ProvisionTarget, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ProvisionState>,
    {
        self.node_mut(node_id)
            .transitions
            .insert(target, states.into_iter().map(Into::into).collect());
        self
    }

    /// Script the usual enroll -> active walk, with one in-progress poll per wait
    pub fn with_happy_path(self, node_id: &str) -> Self {
        self.with_node(node_id, ProvisionState::Enroll)
            .with_transition(node_id, ProvisionTarget::Manage, ["verifying", "manageable"])
            .with_transition(node_id, ProvisionTarget::Provide, ["cleaning", "available"])
            .with_transition(
                node_id,
                ProvisionTarget::Active,
                ["deploying", "wait call-back", "active"],
            )
    }

    /// Fail patch requests for a node
    pub fn with_patch_error(mut self, node_id: &str, message: &str) -> Self {
        self.node_mut(node_id).patch_error = Some(message.to_string());
        self
    }

    /// Fail provision state changes to `target` for a node
    pub fn with_state_change_error(
        mut self,
        node_id: &str,
        target: ProvisionTarget,
        message: &str,
    ) -> Self {
        self.node_mut(node_id)
            .state_change_errors
            .insert(target, message.to_string());
        self
    }

    /// Fail every get for a node after `successful` gets have been answered
    pub fn with_get_error_after(mut self, node_id: &str, successful: usize, message: &str) -> Self {
        self.node_mut(node_id).get_error = Some((successful, message.to_string()));
        self
    }

    /// All calls received so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Calls received for one node, in order
    pub fn calls_for(&self, node_id: &str) -> Vec<MockCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.node() == node_id)
            .cloned()
            .collect()
    }

    /// Provision targets requested for a node, in order
    pub fn targets_for(&self, node_id: &str) -> Vec<ProvisionTarget> {
        self.calls_for(node_id)
            .into_iter()
            .filter_map(|c| match c {
                MockCall::ChangeState { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    /// Config drive submitted with the `active` request for a node
    pub fn config_drive_for(&self, node_id: &str) -> Option<String> {
        self.calls_for(node_id).into_iter().find_map(|c| match c {
            MockCall::ChangeState {
                target: ProvisionTarget::Active,
                config_drive,
                ..
            } => config_drive,
            _ => None,
        })
    }
}

fn not_found(operation: &str, node_id: &str) -> DeployError {
    DeployError::Transport {
        operation: operation.to_string(),
        status: Some(404),
        message: format!("Node {} could not be found.", node_id),
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn get_node(&self, node_id: &str) -> Result<Node, DeployError> {
        let mut state = self.lock();
        state.calls.push(MockCall::Get {
            node: node_id.to_string(),
        });

        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| not_found("get node", node_id))?;

        if let Some((successful, message)) = &node.get_error {
            if node.gets >= *successful {
                return Err(DeployError::transport("get node", message));
            }
        }
        node.gets += 1;

        Ok(Node::new(node_id, node.observe()))
    }

    async fn change_provision_state(
        &self,
        node_id: &str,
        target: ProvisionTarget,
        config_drive: Option<&str>,
    ) -> Result<(), DeployError> {
        let mut state = self.lock();
        state.calls.push(MockCall::ChangeState {
            node: node_id.to_string(),
            target,
            config_drive: config_drive.map(str::to_string),
        });

        let operation = format!("provision state change to '{}'", target);
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| not_found(&operation, node_id))?;

        if let Some(message) = node.state_change_errors.get(&target) {
            return Err(DeployError::Transport {
                operation,
                status: Some(409),
                message: message.clone(),
            });
        }

        node.pending = node
            .transitions
            .get(&target)
            .cloned()
            .unwrap_or_default()
            .into();
        Ok(())
    }

    async fn patch_node(
        &self,
        node_id: &str,
        operations: &[PatchOperation],
    ) -> Result<(), DeployError> {
        let mut state = self.lock();
        state.calls.push(MockCall::Patch {
            node: node_id.to_string(),
            operations: operations.to_vec(),
        });

        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| not_found("patch node", node_id))?;

        match &node.patch_error {
            Some(message) => Err(DeployError::Transport {
                operation: "patch node".to_string(),
                status: Some(400),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_scripted_transition() {
        let mock = MockNodeClient::new()
            .with_node("n1", "enroll")
            .with_transition("n1", ProvisionTarget::Manage, ["verifying", "manageable"]);

        assert_eq!(
            mock.get_node("n1").await.unwrap().provision_state,
            ProvisionState::Enroll
        );

        mock.change_provision_state("n1", ProvisionTarget::Manage, None)
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(mock.get_node("n1").await.unwrap().provision_state);
        }
        assert_eq!(
            seen,
            vec![
                ProvisionState::Verifying,
                ProvisionState::Manageable,
                ProvisionState::Manageable
            ]
        );
    }

    #[tokio::test]
    async fn test_mock_unknown_node() {
        let mock = MockNodeClient::new();
        let err = mock.get_node("missing").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_mock_get_error_after() {
        let mock = MockNodeClient::new()
            .with_node("n1", "verifying")
            .with_get_error_after("n1", 1, "connection reset");

        assert!(mock.get_node("n1").await.is_ok());
        let err = mock.get_node("n1").await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let mock = MockNodeClient::new().with_happy_path("n1").with_happy_path("n2");

        mock.patch_node("n1", &[PatchOperation::remove("/extra/a")])
            .await
            .unwrap();
        mock.change_provision_state("n2", ProvisionTarget::Active, Some("drive"))
            .await
            .unwrap();

        assert_eq!(mock.calls().len(), 2);
        assert_eq!(mock.calls_for("n1").len(), 1);
        assert_eq!(mock.targets_for("n2"), vec![ProvisionTarget::Active]);
        assert_eq!(mock.config_drive_for("n2").as_deref(), Some("drive"));
        assert_eq!(mock.config_drive_for("n1"), None);
    }

    #[tokio::test]
    async fn test_mock_state_change_error() {
        let mock = MockNodeClient::new().with_happy_path("n1").with_state_change_error(
            "n1",
            ProvisionTarget::Provide,
            "node is locked",
        );

        assert!(
            mock.change_provision_state("n1", ProvisionTarget::Manage, None)
                .await
                .is_ok()
        );
        let err = mock
            .change_provision_state("n1", ProvisionTarget::Provide, None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(409));
    }
}

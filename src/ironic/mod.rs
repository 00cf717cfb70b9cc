//! Ironic bare metal API seam
//!
//! The orchestrator only talks to the provisioning service through the
//! [`NodeClient`] trait. [`client::IronicClient`] implements it over HTTP and
//! [`mock::MockNodeClient`] replays scripted node states for tests.

pub mod client;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::DeployError;

pub use client::IronicClient;

/// Provision state as reported by the bare metal service
///
/// Known states map onto variants; anything else is preserved verbatim in
/// [`ProvisionState::Other`] so it can be reported back to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProvisionState {
    Enroll,
    Verifying,
    Manageable,
    Inspecting,
    InspectWait,
    InspectFailed,
    Cleaning,
    CleanWait,
    CleanFailed,
    Available,
    Deploying,
    DeployWait,
    DeployFailed,
    Active,
    Deleting,
    Error,
    Other(String),
}

impl ProvisionState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Enroll => "enroll",
            Self::Verifying => "verifying",
            Self::Manageable => "manageable",
            Self::Inspecting => "inspecting",
            Self::InspectWait => "inspect wait",
            Self::InspectFailed => "inspect failed",
            Self::Cleaning => "cleaning",
            Self::CleanWait => "clean wait",
            Self::CleanFailed => "clean failed",
            Self::Available => "available",
            Self::Deploying => "deploying",
            Self::DeployWait => "wait call-back",
            Self::DeployFailed => "deploy failed",
            Self::Active => "active",
            Self::Deleting => "deleting",
            Self::Error => "error",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for ProvisionState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "enroll" => Self::Enroll,
            "verifying" => Self::Verifying,
            "manageable" => Self::Manageable,
            "inspecting" => Self::Inspecting,
            "inspect wait" => Self::InspectWait,
            "inspect failed" => Self::InspectFailed,
            "cleaning" => Self::Cleaning,
            "clean wait" => Self::CleanWait,
            "clean failed" => Self::CleanFailed,
            "available" => Self::Available,
            "deploying" => Self::Deploying,
            "wait call-back" => Self::DeployWait,
            "deploy failed" => Self::DeployFailed,
            "active" => Self::Active,
            "deleting" => Self::Deleting,
            "error" => Self::Error,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for ProvisionState {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<ProvisionState> for String {
    fn from(state: ProvisionState) -> Self {
        match state {
            ProvisionState::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target of a provision state change request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionTarget {
    Manage,
    Provide,
    Active,
}

impl std::fmt::Display for ProvisionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manage => write!(f, "manage"),
            Self::Provide => write!(f, "provide"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// The subset of an Ironic node this crate observes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    pub provision_state: ProvisionState,
    #[serde(default)]
    pub target_provision_state: Option<ProvisionState>,
    #[serde(default)]
    pub power_state: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Node {
    /// Create a node in the given provision state
    pub fn new(uuid: impl Into<String>, provision_state: ProvisionState) -> Self {
        Self {
            uuid: uuid.into(),
            name: None,
            provision_state,
            target_provision_state: None,
            power_state: None,
            last_error: None,
        }
    }
}

/// JSON patch operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

/// A single JSON patch operation applied to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl PatchOperation {
    /// `add` operation setting `path` to `value`
    pub fn add(path: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            op: PatchOp::Add,
            path: path.into(),
            value: Some(value.into()),
        }
    }

    /// `replace` operation setting `path` to `value`
    pub fn replace(path: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            op: PatchOp::Replace,
            path: path.into(),
            value: Some(value.into()),
        }
    }

    /// `remove` operation for `path`
    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            value: None,
        }
    }
}

/// Operations the orchestrator needs from the bare metal service
///
/// Implementations own transport concerns (authentication, retries, API
/// versioning); errors are reported as [`DeployError::Transport`].
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch the current view of a node
    async fn get_node(&self, node_id: &str) -> Result<Node, DeployError>;

    /// Request a provision state change, optionally attaching a config drive
    async fn change_provision_state(
        &self,
        node_id: &str,
        target: ProvisionTarget,
        config_drive: Option<&str>,
    ) -> Result<(), DeployError>;

    /// Apply JSON patch operations to a node
    async fn patch_node(
        &self,
        node_id: &str,
        operations: &[PatchOperation],
    ) -> Result<(), DeployError>;
}

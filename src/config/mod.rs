//! Settings and deployment plans
//!
//! Both are YAML documents. Settings describe how to reach Ironic and how
//! patiently to poll it; a plan lists the nodes to deploy and what goes on
//! each node's config drive.

pub mod loader;

pub use loader::{load_plan, load_settings};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::deploy::poll::{DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT};
use crate::ironic::PatchOperation;
use crate::ironic::client::DEFAULT_MICROVERSION;

/// Ironic endpoint used when nothing else is configured
pub const DEFAULT_ENDPOINT: &str = "http://localhost:6385";

/// Default HTTP request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Top-level settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ironic: IronicSettings,
    pub polling: PollingSettings,
    /// Where config drives are staged; the system temp dir when unset
    pub staging_dir: Option<PathBuf>,
}

/// How to reach the bare metal service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IronicSettings {
    pub endpoint: String,
    pub microversion: String,
    pub request_timeout_secs: u64,
}

impl Default for IronicSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            microversion: DEFAULT_MICROVERSION.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// How waits poll a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub interval_secs: u64,
    /// Upper bound on a single wait; 0 disables it
    pub timeout_secs: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            timeout_secs: DEFAULT_WAIT_TIMEOUT.as_secs(),
        }
    }
}

/// A set of nodes to deploy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentPlan {
    pub nodes: Vec<NodePlan>,

    /// Directory relative `file` paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl DeploymentPlan {
    /// Look up a node by id
    pub fn node(&self, node_id: &str) -> Option<&NodePlan> {
        self.nodes.iter().find(|n| n.node == node_id)
    }
}

/// What to do with one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePlan {
    /// Node UUID or name
    pub node: String,

    #[serde(default)]
    pub instance_info: Option<Map<String, Value>>,

    #[serde(default)]
    pub properties: Option<Map<String, Value>>,

    /// Extra JSON-patch operations, applied after instance info and properties
    #[serde(default)]
    pub patch: Vec<PatchOperation>,

    #[serde(default)]
    pub config_drive: DrivePlan,
}

/// Config drive section of a node plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrivePlan {
    pub user_data: Option<UserDataSource>,
    pub meta_data: Option<Map<String, Value>>,
    pub network_data: Option<Map<String, Value>>,
}

/// Where user data comes from; exactly one field must be set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserDataSource {
    /// Inline text
    pub text: Option<String>,
    /// File copied byte for byte
    pub file: Option<PathBuf>,
    /// Mapping written as indented JSON
    pub json: Option<Map<String, Value>>,
}

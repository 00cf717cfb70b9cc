//! Deployment states and the transition table

use crate::ironic::{ProvisionState, ProvisionTarget};

/// Highest percentage reported before the node is actually active
pub const WAIT_DEPLOY_CEILING: u8 = 99;

/// Where a deployment is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentState {
    Begin,
    Configure,
    Manage,
    WaitManage,
    Provide,
    WaitProvide,
    Deploy,
    WaitDeploy,
    Done,
    Error,
}

/// Every state a successful deployment passes through, in order
pub const HAPPY_PATH: [DeploymentState; 9] = [
    DeploymentState::Begin,
    DeploymentState::Configure,
    DeploymentState::Manage,
    DeploymentState::WaitManage,
    DeploymentState::Provide,
    DeploymentState::WaitProvide,
    DeploymentState::Deploy,
    DeploymentState::WaitDeploy,
    DeploymentState::Done,
];

impl DeploymentState {
    /// Percentage reported on entering this state
    ///
    /// `WaitDeploy` starts here and ramps towards [`WAIT_DEPLOY_CEILING`].
    /// `Error` has no weight; it repeats whatever was last reported.
    pub fn progress(self) -> Option<u8> {
        match self {
            Self::Begin => Some(0),
            Self::Configure => Some(10),
            Self::Manage => Some(15),
            Self::WaitManage => Some(20),
            Self::Provide => Some(25),
            Self::WaitProvide => Some(30),
            Self::Deploy => Some(35),
            Self::WaitDeploy => Some(40),
            Self::Done => Some(100),
            Self::Error => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Transition table: the state that follows this one
    ///
    /// Failure anywhere before a terminal state leads to `Error`; terminal
    /// states never move.
    pub fn next(self, succeeded: bool) -> Self {
        if self.is_terminal() {
            return self;
        }
        if !succeeded {
            return Self::Error;
        }

        match self {
            Self::Begin => Self::Configure,
            Self::Configure => Self::Manage,
            Self::Manage => Self::WaitManage,
            Self::WaitManage => Self::Provide,
            Self::Provide => Self::WaitProvide,
            Self::WaitProvide => Self::Deploy,
            Self::Deploy => Self::WaitDeploy,
            Self::WaitDeploy => Self::Done,
            Self::Done | Self::Error => self,
        }
    }

    /// Provision state change requested on entering this state
    pub fn request(self) -> Option<ProvisionTarget> {
        match self {
            Self::Manage => Some(ProvisionTarget::Manage),
            Self::Provide => Some(ProvisionTarget::Provide),
            Self::Deploy => Some(ProvisionTarget::Active),
            _ => None,
        }
    }

    /// Provision state a waiting state polls for
    pub fn awaited(self) -> Option<ProvisionState> {
        match self {
            Self::WaitManage => Some(ProvisionState::Manageable),
            Self::WaitProvide => Some(ProvisionState::Available),
            Self::WaitDeploy => Some(ProvisionState::Active),
            _ => None,
        }
    }

    /// Whether `observed` means the remote side is still working
    pub fn is_in_progress(self, observed: &ProvisionState) -> bool {
        matches!(
            (self, observed),
            (Self::WaitManage, ProvisionState::Verifying)
                | (Self::WaitProvide, ProvisionState::Cleaning)
                | (
                    Self::WaitDeploy,
                    ProvisionState::Deploying | ProvisionState::DeployWait
                )
        )
    }

    /// Whether in-progress polls advance the reported percentage
    pub fn ramps(self) -> bool {
        self == Self::WaitDeploy
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Begin => "BEGIN",
            Self::Configure => "CONFIGURE",
            Self::Manage => "MANAGE",
            Self::WaitManage => "WAIT_MANAGE",
            Self::Provide => "PROVIDE",
            Self::WaitProvide => "WAIT_PROVIDE",
            Self::Deploy => "DEPLOY",
            Self::WaitDeploy => "WAIT_DEPLOY",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A progress report sent to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub state: DeploymentState,
    pub percent: u8,
}

impl Progress {
    /// The terminal marker of a failed deployment
    pub fn is_error(&self) -> bool {
        self.state == DeploymentState::Error
    }
}

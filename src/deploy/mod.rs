//! Deployment orchestration
//!
//! A [`Deployment`] takes one Ironic node from wherever it was enrolled to
//! `active`:
//!
//! 1. Configure - patch instance info and properties onto the node
//! 2. Manage - move to `manageable`, waiting out `verifying`
//! 3. Provide - move to `available`, waiting out `cleaning`
//! 4. Deploy - build the config drive, request `active` and wait it out
//!
//! The states and their order live in [`state`]; [`Deployment::run`] is the
//! single loop that interprets them.

pub mod poll;
pub mod state;

pub use poll::PollOptions;
pub use state::{DeploymentState, HAPPY_PATH, Progress, WAIT_DEPLOY_CEILING};

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::DeployError;
use crate::configdrive::{ConfigDrive, ConfigDriveBuilder};
use crate::ironic::{NodeClient, PatchOperation, ProvisionTarget};
use poll::Poller;

/// Sends progress to the caller; the only writer of the channel
#[derive(Debug, Default)]
struct ProgressReporter {
    sender: Option<UnboundedSender<Progress>>,
    percent: u8,
}

impl ProgressReporter {
    fn report(&mut self, state: DeploymentState, percent: u8) {
        self.percent = percent;
        if let Some(sender) = &self.sender {
            if sender.send(Progress { state, percent }).is_err() {
                warn!("Progress receiver dropped, no longer reporting");
                self.sender = None;
            }
        }
    }

    /// Report entry into `state`; `Error` repeats the last percentage
    fn enter(&mut self, state: DeploymentState) {
        let percent = state.progress().unwrap_or(self.percent);
        self.report(state, percent);
    }

    /// Advance one step towards the ceiling
    fn ramp(&mut self, state: DeploymentState) {
        let percent = self.percent.saturating_add(1).min(WAIT_DEPLOY_CEILING);
        self.report(state, percent);
    }

    /// Drop the sender, closing the channel
    fn close(&mut self) {
        self.sender = None;
    }
}

/// One attempt at deploying one node
///
/// # Example
/// ```no_run
/// use baremetal_deploy::configdrive::ConfigDrive;
/// use baremetal_deploy::deploy::Deployment;
/// use baremetal_deploy::ironic::IronicClient;
///
/// # async fn example() -> Result<(), baremetal_deploy::DeployError> {
/// let client = IronicClient::new("http://localhost:6385")?;
/// let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
///
/// let mut deployment = Deployment::new("1be26c0b-03f2-4d2e-ae87-c02d7f33c123")
///     .with_config_drive(ConfigDrive::new().with_user_data("#cloud-config\n"))
///     .with_progress(tx);
///
/// let handle = tokio::spawn(async move { deployment.run(&client).await });
/// while let Some(progress) = rx.recv().await {
///     println!("{}: {}%", progress.state, progress.percent);
/// }
/// handle.await.expect("task panicked")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Deployment {
    node_id: String,
    patch: Vec<PatchOperation>,
    config_drive: ConfigDrive,
    builder: ConfigDriveBuilder,
    options: PollOptions,
    cancel: CancellationToken,
    state: DeploymentState,
    reporter: ProgressReporter,
    error: Option<DeployError>,
}

impl Deployment {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            patch: Vec::new(),
            config_drive: ConfigDrive::default(),
            builder: ConfigDriveBuilder::default(),
            options: PollOptions::default(),
            cancel: CancellationToken::new(),
            state: DeploymentState::Begin,
            reporter: ProgressReporter::default(),
            error: None,
        }
    }

    /// Append patch operations applied during CONFIGURE
    pub fn with_patch(mut self, operations: impl IntoIterator<Item = PatchOperation>) -> Self {
        self.patch.extend(operations);
        self
    }

    /// Set `/instance_info` (image source, checksum, root size...)
    pub fn with_instance_info(self, instance_info: Map<String, Value>) -> Self {
        self.with_patch([PatchOperation::add("/instance_info", instance_info)])
    }

    /// Set `/properties` (root device hints and the like)
    pub fn with_properties(self, properties: Map<String, Value>) -> Self {
        self.with_patch([PatchOperation::add("/properties", properties)])
    }

    pub fn with_config_drive(mut self, config_drive: ConfigDrive) -> Self {
        self.config_drive = config_drive;
        self
    }

    pub fn with_builder(mut self, builder: ConfigDriveBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_poll_options(mut self, options: PollOptions) -> Self {
        self.options = options;
        self
    }

    /// Token that cancels every wait of this deployment
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Channel receiving progress; closed once the run is over
    pub fn with_progress(mut self, sender: UnboundedSender<Progress>) -> Self {
        self.reporter.sender = Some(sender);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Last percentage reported
    pub fn percent(&self) -> u8 {
        self.reporter.percent
    }

    /// Error that ended the run, if any
    pub fn error(&self) -> Option<&DeployError> {
        self.error.as_ref()
    }

    pub fn patch_operations(&self) -> &[PatchOperation] {
        &self.patch
    }

    pub fn config_drive(&self) -> &ConfigDrive {
        &self.config_drive
    }

    /// Drive the node through every state until DONE or ERROR
    ///
    /// Returns once a terminal state is reached. The error, if any, is also
    /// kept on the deployment. A deployment runs at most once.
    pub async fn run(&mut self, client: &dyn NodeClient) -> Result<(), DeployError> {
        if self.state != DeploymentState::Begin {
            return Err(DeployError::Config(format!(
                "deployment of node {} has already run",
                self.node_id
            )));
        }

        let span = info_span!("deploy", node = %self.node_id);
        async {
            loop {
                let state = self.state;
                self.reporter.enter(state);
                if state.is_terminal() {
                    break;
                }

                let result = self.step(client, state).await;
                if let Err(err) = &result {
                    error!("{} failed: {}", state, err);
                    self.error = Some(err.clone());
                }

                self.state = state.next(result.is_ok());
                debug!("{} -> {}", state, self.state);
            }

            self.reporter.close();
            match &self.error {
                Some(err) => Err(err.clone()),
                None => {
                    info!("Node {} is active", self.node_id);
                    Ok(())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn step(
        &mut self,
        client: &dyn NodeClient,
        state: DeploymentState,
    ) -> Result<(), DeployError> {
        match (state, state.request()) {
            (DeploymentState::Configure, _) => self.configure(client).await,
            // Only the move to active carries a config drive
            (_, Some(ProvisionTarget::Active)) => self.deploy(client).await,
            (_, Some(target)) => self.request(client, target, None).await,
            _ if state.awaited().is_some() => self.wait(client, state).await,
            _ => Ok(()),
        }
    }

    async fn configure(&self, client: &dyn NodeClient) -> Result<(), DeployError> {
        if self.patch.is_empty() {
            debug!("No patch operations for node {}, skipping", self.node_id);
            return Ok(());
        }

        info!(
            "Applying {} patch operations to node {}",
            self.patch.len(),
            self.node_id
        );
        client.patch_node(&self.node_id, &self.patch).await
    }

    async fn request(
        &self,
        client: &dyn NodeClient,
        target: ProvisionTarget,
        config_drive: Option<&str>,
    ) -> Result<(), DeployError> {
        info!("Requesting '{}' for node {}", target, self.node_id);
        client
            .change_provision_state(&self.node_id, target, config_drive)
            .await
    }

    async fn deploy(&self, client: &dyn NodeClient) -> Result<(), DeployError> {
        let config_drive = self.builder.build(&self.config_drive).await?;
        self.request(client, ProvisionTarget::Active, Some(&config_drive))
            .await
    }

    async fn wait(
        &mut self,
        client: &dyn NodeClient,
        state: DeploymentState,
    ) -> Result<(), DeployError> {
        let poller = Poller {
            client,
            node_id: &self.node_id,
            options: &self.options,
            cancel: &self.cancel,
        };
        let reporter = &mut self.reporter;

        poller
            .wait(state, |_| {
                if state.ramps() {
                    reporter.ramp(state);
                }
            })
            .await
    }
}

/// Outcome of one deployment started by [`run_all`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentReport {
    pub node_id: String,
    pub result: Result<(), DeployError>,
}

/// Run deployments concurrently, one task per node
///
/// Reports come back in input order once every deployment has finished.
pub async fn run_all(
    client: Arc<dyn NodeClient>,
    deployments: Vec<Deployment>,
) -> Vec<DeploymentReport> {
    let handles: Vec<_> = deployments
        .into_iter()
        .map(|mut deployment| {
            let client = Arc::clone(&client);
            let node_id = deployment.node_id().to_string();
            let handle = tokio::spawn(async move { deployment.run(client.as_ref()).await });
            (node_id, handle)
        })
        .collect();

    let mut reports = Vec::with_capacity(handles.len());
    for (node_id, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(DeployError::Config(format!(
                "deployment task for node {} failed: {}",
                node_id, e
            ))),
        };
        reports.push(DeploymentReport { node_id, result });
    }
    reports
}

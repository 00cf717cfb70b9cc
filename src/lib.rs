//! baremetal-deploy library
//!
//! Drives Ironic bare metal nodes from enrollment to `active` and builds the
//! config drives they boot with.
//!
//! # Layout
//!
//! - [`ironic`]: node model, the [`NodeClient`](ironic::NodeClient) seam, an
//!   HTTP client and a scripted mock
//! - [`configdrive`]: user data, the ISO-9660 writer and the gzip/base64
//!   packaging Ironic expects
//! - [`deploy`]: the per-node state machine and its progress reporting
//! - [`config`]: YAML settings and deployment plans

pub mod config;
pub mod configdrive;
pub mod deploy;
pub mod ironic;

mod error;

pub use configdrive::{ConfigDrive, ConfigDriveBuilder, UserData};
pub use deploy::{Deployment, DeploymentState, Progress, run_all};
pub use error::DeployError;
pub use ironic::{IronicClient, NodeClient};

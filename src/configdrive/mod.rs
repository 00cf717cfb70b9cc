//! Config drive construction
//!
//! A config drive is a small ISO-9660 filesystem, labelled `config-2`, that
//! the node mounts on first boot. Its layout follows the OpenStack metadata
//! format:
//!
//! ```text
//! openstack/latest/user_data
//! openstack/latest/meta_data.json
//! openstack/latest/network_data.json
//! ```
//!
//! Ironic accepts the drive as a gzipped image encoded with standard base64.

pub mod iso9660;
pub mod userdata;

pub use iso9660::{Directory, IsoImage};
pub use userdata::UserData;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::DeployError;

/// Volume label first-boot tooling looks for
pub const VOLUME_ID: &str = "config-2";

/// Directory, relative to the drive root, holding the payload files
pub const LATEST_PATH: &str = "openstack/latest";

pub const USER_DATA_FILE: &str = "user_data";
pub const META_DATA_FILE: &str = "meta_data.json";
pub const NETWORK_DATA_FILE: &str = "network_data.json";

const STAGING_PREFIX: &str = "configdrive-";

/// Contents of a config drive
///
/// Every part is optional; a drive with nothing in it is still a valid
/// (if useless) image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDrive {
    pub user_data: Option<UserData>,
    pub meta_data: Option<Map<String, Value>>,
    pub network_data: Option<Map<String, Value>>,
}

impl ConfigDrive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_data(mut self, user_data: impl Into<UserData>) -> Self {
        self.user_data = Some(user_data.into());
        self
    }

    pub fn with_meta_data(mut self, meta_data: Map<String, Value>) -> Self {
        self.meta_data = Some(meta_data);
        self
    }

    pub fn with_network_data(mut self, network_data: Map<String, Value>) -> Self {
        self.network_data = Some(network_data);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.user_data.is_none() && self.meta_data.is_none() && self.network_data.is_none()
    }
}

/// Builds base64 encoded config drive images
///
/// Each build stages files in its own freshly created directory, so one
/// builder can serve any number of concurrent deployments.
#[derive(Debug, Clone)]
pub struct ConfigDriveBuilder {
    staging_root: Option<PathBuf>,
}

impl Default for ConfigDriveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigDriveBuilder {
    /// Builder staging under the system temporary directory
    pub fn new() -> Self {
        Self { staging_root: None }
    }

    /// Stage builds under a custom directory
    pub fn with_staging_root(mut self, root: impl AsRef<Path>) -> Self {
        self.staging_root = Some(root.as_ref().to_path_buf());
        self
    }

    fn staging_dir(&self) -> Result<TempDir, DeployError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGING_PREFIX);

        let dir = match &self.staging_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        dir.map_err(|e| DeployError::build("creating staging directory", e))
    }

    /// Build the drive and return it gzipped and base64 encoded
    pub async fn build(&self, drive: &ConfigDrive) -> Result<String, DeployError> {
        let staging = self.staging_dir()?;
        debug!("Staging config drive in {}", staging.path().display());

        let result = self.build_in(staging.path(), drive).await;

        let staging_path = staging.path().to_path_buf();
        if let Err(e) = staging.close() {
            warn!(
                "Failed to remove staging directory {}: {}",
                staging_path.display(),
                e
            );
        }

        result
    }

    async fn build_in(&self, staging: &Path, drive: &ConfigDrive) -> Result<String, DeployError> {
        let latest = staging.join(LATEST_PATH);
        fs::create_dir_all(&latest)
            .await
            .map_err(|e| DeployError::build("creating drive layout", e))?;

        if let Some(user_data) = &drive.user_data {
            write_payload(&latest.join(USER_DATA_FILE), &user_data.to_bytes()?).await?;
        }

        if let Some(meta_data) = &drive.meta_data {
            write_payload(&latest.join(META_DATA_FILE), &serde_json::to_vec(meta_data)?).await?;
        }

        if let Some(network_data) = &drive.network_data {
            write_payload(
                &latest.join(NETWORK_DATA_FILE),
                &serde_json::to_vec(network_data)?,
            )
            .await?;
        }

        let tree = load_tree(staging).await?;
        let image = iso9660::write_image(&tree, VOLUME_ID)?;
        let compressed = gzip(&image)?;
        let encoded = BASE64.encode(&compressed);

        info!(
            "Built config drive: {} bytes image, {} bytes gzipped, {} bytes encoded",
            image.len(),
            compressed.len(),
            encoded.len()
        );

        Ok(encoded)
    }
}

async fn write_payload(path: &Path, data: &[u8]) -> Result<(), DeployError> {
    debug!("Writing {} bytes to {}", data.len(), path.display());
    fs::write(path, data)
        .await
        .map_err(|e| DeployError::build(&format!("writing {}", path.display()), e))
}

/// Read a staged directory back into memory
async fn load_tree(root: &Path) -> Result<Directory, DeployError> {
    let mut tree = Directory::new();
    let mut pending = vec![String::new()];

    while let Some(relative) = pending.pop() {
        let mut entries = fs::read_dir(root.join(&relative))
            .await
            .map_err(|e| DeployError::build("reading staging directory", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DeployError::build("reading staging directory", e))?
        {
            let name = entry.file_name().into_string().map_err(|name| {
                DeployError::Build(format!("non UTF-8 file name {:?} in staging area", name))
            })?;
            let path = if relative.is_empty() {
                name
            } else {
                format!("{}/{}", relative, name)
            };

            let file_type = entry
                .file_type()
                .await
                .map_err(|e| DeployError::build("reading staging directory", e))?;

            if file_type.is_dir() {
                tree.dir_mut(&path);
                pending.push(path);
            } else if file_type.is_file() {
                let data = fs::read(entry.path())
                    .await
                    .map_err(|e| DeployError::build(&format!("reading {}", path), e))?;
                tree.insert_file(&path, data);
            }
        }
    }

    Ok(tree)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, DeployError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| DeployError::build("compressing image", e))?;
    encoder
        .finish()
        .map_err(|e| DeployError::build("compressing image", e))
}

/// Decode a base64 config drive back into its ISO image
pub fn decode(encoded: &str) -> Result<IsoImage, DeployError> {
    let compressed = BASE64
        .decode(encoded.trim())
        .map_err(|e| DeployError::build("decoding base64", e))?;

    let mut image = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut image)
        .map_err(|e| DeployError::build("decompressing image", e))?;

    IsoImage::parse(&image)
}

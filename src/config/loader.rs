//! Settings and plan loader
//!
//! Reads YAML from disk and turns node plans into ready-to-run deployments.

use super::{DeploymentPlan, DrivePlan, NodePlan, Settings, UserDataSource};
use crate::DeployError;
use crate::configdrive::{ConfigDrive, ConfigDriveBuilder, UserData};
use crate::deploy::{Deployment, PollOptions};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Load settings from a YAML file
///
/// A missing file is not an error: every setting has a default.
pub async fn load_settings(path: impl AsRef<Path>) -> Result<Settings, DeployError> {
    let path = path.as_ref();

    if !path.exists() {
        debug!("No settings at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    let content = read(path).await?;
    let settings = serde_yaml::from_str(&content)
        .map_err(|e| DeployError::Config(format!("{}: {}", path.display(), e)))?;

    debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load a deployment plan from a YAML file
pub async fn load_plan(path: impl AsRef<Path>) -> Result<DeploymentPlan, DeployError> {
    let path = path.as_ref();
    let content = read(path).await?;

    let mut plan: DeploymentPlan = serde_yaml::from_str(&content)
        .map_err(|e| DeployError::Config(format!("{}: {}", path.display(), e)))?;
    plan.base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    if let Some(index) = plan.nodes.iter().position(|n| n.node.trim().is_empty()) {
        return Err(DeployError::Config(format!(
            "{}: node #{} has no id",
            path.display(),
            index + 1
        )));
    }

    info!("Loaded plan with {} nodes from {}", plan.nodes.len(), path.display());
    Ok(plan)
}

async fn read(path: &Path) -> Result<String, DeployError> {
    fs::read_to_string(path)
        .await
        .map_err(|e| DeployError::Config(format!("reading {}: {}", path.display(), e)))
}

async fn read_bytes(path: &Path) -> Result<Vec<u8>, DeployError> {
    fs::read(path)
        .await
        .map_err(|e| DeployError::Config(format!("reading {}: {}", path.display(), e)))
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Resolve a user data source into its payload
pub async fn resolve_user_data(
    source: &UserDataSource,
    base_dir: &Path,
) -> Result<UserData, DeployError> {
    match (&source.text, &source.file, &source.json) {
        (Some(text), None, None) => Ok(UserData::Text(text.clone())),
        (None, Some(file), None) => {
            let path = resolve(base_dir, file);
            debug!("Reading user data from {}", path.display());
            Ok(UserData::Raw(read_bytes(&path).await?))
        }
        (None, None, Some(json)) => Ok(UserData::Map(json.clone())),
        _ => Err(DeployError::Config(
            "user_data needs exactly one of 'text', 'file' or 'json'".to_string(),
        )),
    }
}

/// Resolve the config drive section of a node plan
pub async fn resolve_config_drive(
    plan: &DrivePlan,
    base_dir: &Path,
) -> Result<ConfigDrive, DeployError> {
    let mut drive = ConfigDrive::new();

    if let Some(source) = &plan.user_data {
        drive.user_data = Some(resolve_user_data(source, base_dir).await?);
    }
    drive.meta_data = plan.meta_data.clone();
    drive.network_data = plan.network_data.clone();

    Ok(drive)
}

/// Turn one node plan into a deployment configured from `settings`
pub async fn build_deployment(
    node: &NodePlan,
    base_dir: &Path,
    settings: &Settings,
) -> Result<Deployment, DeployError> {
    let config_drive = resolve_config_drive(&node.config_drive, base_dir).await?;

    let mut builder = ConfigDriveBuilder::new();
    if let Some(staging_dir) = &settings.staging_dir {
        builder = builder.with_staging_root(staging_dir);
    }

    let mut deployment = Deployment::new(&node.node)
        .with_config_drive(config_drive)
        .with_builder(builder)
        .with_poll_options(PollOptions::from(&settings.polling));

    if let Some(instance_info) = &node.instance_info {
        deployment = deployment.with_instance_info(instance_info.clone());
    }
    if let Some(properties) = &node.properties {
        deployment = deployment.with_properties(properties.clone());
    }

    Ok(deployment.with_patch(node.patch.iter().cloned()))
}

/// Turn every node of a plan into a deployment
pub async fn build_deployments(
    plan: &DeploymentPlan,
    settings: &Settings,
) -> Result<Vec<Deployment>, DeployError> {
    let mut deployments = Vec::with_capacity(plan.nodes.len());
    for node in &plan.nodes {
        deployments.push(build_deployment(node, &plan.base_dir, settings).await?);
    }
    Ok(deployments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ironic::PatchOperation;
    use serde_json::json;
    use tempfile::TempDir;

    const PLAN: &str = r#"
nodes:
  - node: master-0
    instance_info:
      image_source: http://172.22.0.1/images/rhcos.qcow2
    patch:
      - op: remove
        path: /extra/stale
    config_drive:
      user_data:
        file: master.ign
      network_data:
        links: []
  - node: worker-0
    config_drive:
      user_data:
        json:
          ignition:
            version: 3.2.0
"#;

    #[tokio::test]
    async fn test_load_settings_missing_file() {
        let settings = load_settings("/nonexistent/settings.yaml").await.unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[tokio::test]
    async fn test_load_settings_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.yaml");
        fs::write(&path, "polling:\n  timeout_secs: 0\nstaging_dir: /var/tmp\n")
            .await
            .unwrap();

        let settings = load_settings(&path).await.unwrap();
        assert_eq!(settings.polling.timeout_secs, 0);
        assert_eq!(settings.staging_dir, Some(PathBuf::from("/var/tmp")));
        assert_eq!(settings.ironic.endpoint, "http://localhost:6385");
    }

    #[tokio::test]
    async fn test_load_settings_invalid_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.yaml");
        fs::write(&path, "polling: [not, a, mapping]").await.unwrap();

        let err = load_settings(&path).await.unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[tokio::test]
    async fn test_load_plan_sets_base_dir() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plan.yaml");
        fs::write(&path, PLAN).await.unwrap();

        let plan = load_plan(&path).await.unwrap();
        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.base_dir, temp.path());
    }

    #[tokio::test]
    async fn test_load_plan_missing_file() {
        let err = load_plan("/nonexistent/plan.yaml").await.unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[tokio::test]
    async fn test_load_plan_rejects_blank_node() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plan.yaml");
        fs::write(&path, "nodes:\n  - node: ''\n").await.unwrap();

        assert!(load_plan(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_user_data_sources() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("user.txt"), "#!/bin/sh\necho hi\n")
            .await
            .unwrap();

        let text = UserDataSource {
            text: Some("inline".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_user_data(&text, temp.path()).await.unwrap(),
            UserData::Text("inline".to_string())
        );

        let file = UserDataSource {
            file: Some(PathBuf::from("user.txt")),
            ..Default::default()
        };
        assert_eq!(
            resolve_user_data(&file, temp.path()).await.unwrap(),
            UserData::Raw(b"#!/bin/sh\necho hi\n".to_vec())
        );

        let both = UserDataSource {
            text: Some("inline".to_string()),
            file: Some(PathBuf::from("user.txt")),
            json: None,
        };
        assert!(resolve_user_data(&both, temp.path()).await.is_err());
        assert!(
            resolve_user_data(&UserDataSource::default(), temp.path())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_gzip_user_data_file_round_trips() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder
            .write_all(b"#cloud-config\npackages:\n  - ipmitool\n")
            .unwrap();
        let gzipped = encoder.finish().unwrap();
        assert!(String::from_utf8(gzipped.clone()).is_err());

        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("user-data.gz"), &gzipped)
            .await
            .unwrap();

        let plan = DrivePlan {
            user_data: Some(UserDataSource {
                file: Some(PathBuf::from("user-data.gz")),
                ..Default::default()
            }),
            ..Default::default()
        };
        let drive = resolve_config_drive(&plan, temp.path()).await.unwrap();

        let encoded = ConfigDriveBuilder::new()
            .with_staging_root(temp.path())
            .build(&drive)
            .await
            .unwrap();
        let image = crate::configdrive::decode(&encoded).unwrap();
        assert_eq!(
            image.read("openstack/latest/user_data"),
            Some(gzipped.as_slice())
        );
    }

    #[tokio::test]
    async fn test_build_deployments() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("plan.yaml"), PLAN).await.unwrap();
        fs::write(temp.path().join("master.ign"), "{\"ignition\":{}}")
            .await
            .unwrap();

        let plan = load_plan(temp.path().join("plan.yaml")).await.unwrap();
        let mut settings = Settings::default();
        settings.polling.interval_secs = 1;

        let deployments = build_deployments(&plan, &settings).await.unwrap();
        assert_eq!(deployments.len(), 2);

        let master = &deployments[0];
        assert_eq!(master.node_id(), "master-0");
        assert_eq!(
            master.patch_operations(),
            &[
                PatchOperation::add(
                    "/instance_info",
                    json!({"image_source": "http://172.22.0.1/images/rhcos.qcow2"})
                ),
                PatchOperation::remove("/extra/stale"),
            ]
        );
        assert_eq!(
            master.config_drive().user_data,
            Some(UserData::Raw(b"{\"ignition\":{}}".to_vec()))
        );
        assert!(master.config_drive().network_data.is_some());

        let worker = &deployments[1];
        assert!(worker.patch_operations().is_empty());
        assert!(matches!(
            worker.config_drive().user_data,
            Some(UserData::Map(_))
        ));
    }

    #[tokio::test]
    async fn test_build_deployment_missing_user_data_file() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("plan.yaml"), PLAN).await.unwrap();

        let plan = load_plan(temp.path().join("plan.yaml")).await.unwrap();
        let err = build_deployments(&plan, &Settings::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("master.ign"));
    }
}

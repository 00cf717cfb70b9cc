//! End-to-end deployment tests
//!
//! Runs whole deployments against wiremock standing in for Ironic, and
//! against the scripted mock client for the concurrent cases.

use baremetal_deploy::config::{Settings, loader};
use baremetal_deploy::configdrive::{self, ConfigDrive};
use baremetal_deploy::deploy::{Deployment, DeploymentState, PollOptions, run_all};
use baremetal_deploy::ironic::mock::MockNodeClient;
use baremetal_deploy::ironic::{IronicClient, NodeClient, ProvisionTarget};
use baremetal_deploy::DeployError;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_test::assert_ok;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NODE: &str = "4e41df61-84b1-4f04-bd16-2cd4e9a5d2a8";

fn fast() -> PollOptions {
    PollOptions::new(Duration::from_millis(5), Some(Duration::from_secs(10)))
}

async fn mount_states(server: &MockServer, states: &[&str]) {
    for state in states {
        Mock::given(method("GET"))
            .and(path(format!("/v1/nodes/{}", NODE)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uuid": NODE,
                "provision_state": state
            })))
            .up_to_n_times(1)
            .mount(server)
            .await;
    }
}

/// Test a full deployment over HTTP, from enroll to active
#[tokio::test]
async fn test_deploy_over_http() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path(format!("/v1/nodes/{}", NODE)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"uuid": NODE})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path(format!("/v1/nodes/{}/states/provision", NODE)))
        .respond_with(ResponseTemplate::new(202))
        .expect(3)
        .mount(&server)
        .await;

    mount_states(
        &server,
        &[
            "verifying",
            "manageable",
            "cleaning",
            "available",
            "deploying",
            "wait call-back",
            "active",
        ],
    )
    .await;

    let client = IronicClient::new(&server.uri()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut deployment = Deployment::new(NODE)
        .with_instance_info(
            json!({"image_source": "http://172.22.0.1/images/rhcos.qcow2"})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .with_config_drive(
            ConfigDrive::new()
                .with_user_data("#cloud-config\nhostname: master-0\n")
                .with_meta_data(json!({"uuid": NODE}).as_object().cloned().unwrap()),
        )
        .with_poll_options(fast())
        .with_progress(tx);

    assert_ok!(deployment.run(&client).await);
    assert_eq!(deployment.state(), DeploymentState::Done);

    let mut percents = Vec::new();
    while let Some(progress) = rx.recv().await {
        percents.push(progress.percent);
    }
    assert_eq!(percents, vec![0, 10, 15, 20, 25, 30, 35, 40, 41, 42, 100]);

    // The active request carries the drive; the others do not
    let requests = server.received_requests().await.unwrap();
    let bodies: Vec<Value> = requests
        .iter()
        .filter(|r| r.method.as_str() == "PUT")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(bodies[0], json!({"target": "manage"}));
    assert_eq!(bodies[1], json!({"target": "provide"}));
    assert_eq!(bodies[2]["target"], "active");

    let drive = configdrive::decode(bodies[2]["configdrive"].as_str().unwrap()).unwrap();
    assert_eq!(drive.volume_id(), "config-2");
    assert_eq!(
        drive.read("openstack/latest/user_data"),
        Some(&b"#cloud-config\nhostname: master-0\n"[..])
    );
    let meta: Value =
        serde_json::from_slice(drive.read("openstack/latest/meta_data.json").unwrap()).unwrap();
    assert_eq!(meta, json!({"uuid": NODE}));
}

/// Test a node dropping into clean failed stops the deployment
#[tokio::test]
async fn test_clean_failure_over_http() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(format!("/v1/nodes/{}/states/provision", NODE)))
        .respond_with(ResponseTemplate::new(202))
        .expect(2)
        .mount(&server)
        .await;

    mount_states(&server, &["manageable", "cleaning", "clean failed"]).await;

    let client = IronicClient::new(&server.uri()).unwrap();
    let mut deployment = Deployment::new(NODE).with_poll_options(fast());

    let err = deployment.run(&client).await.unwrap_err();
    assert_eq!(deployment.state(), DeploymentState::Error);
    assert_eq!(deployment.percent(), 30);
    assert!(err.to_string().contains("clean failed"));
}

/// Test a plan on disk drives concurrent deployments that stay apart
#[tokio::test]
async fn test_plan_deploys_concurrently() {
    let temp = TempDir::new().unwrap();
    let plan_path = temp.path().join("plan.yaml");
    tokio::fs::write(
        &plan_path,
        r#"
nodes:
  - node: master-0
    config_drive:
      user_data:
        text: "master"
  - node: master-1
    config_drive:
      user_data:
        text: "other master"
  - node: worker-0
    config_drive:
      user_data:
        json:
          role: worker
"#,
    )
    .await
    .unwrap();

    let plan = loader::load_plan(&plan_path).await.unwrap();
    let mut settings = Settings::default();
    settings.staging_dir = Some(temp.path().to_path_buf());

    let deployments: Vec<Deployment> = loader::build_deployments(&plan, &settings)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.with_poll_options(fast()))
        .collect();

    let mock = Arc::new(
        MockNodeClient::new()
            .with_happy_path("master-0")
            .with_happy_path("master-1")
            .with_happy_path("worker-0")
            .with_state_change_error("worker-0", ProvisionTarget::Manage, "Node is in maintenance"),
    );
    let client: Arc<dyn NodeClient> = mock.clone();

    let reports = run_all(client, deployments).await;
    let nodes: Vec<&str> = reports.iter().map(|r| r.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["master-0", "master-1", "worker-0"]);
    assert!(reports[0].result.is_ok());
    assert!(reports[1].result.is_ok());
    assert!(matches!(
        reports[2].result,
        Err(DeployError::Transport { status: Some(409), .. })
    ));

    for (node, expected) in [("master-0", "master"), ("master-1", "other master")] {
        let drive = configdrive::decode(&mock.config_drive_for(node).unwrap()).unwrap();
        assert_eq!(
            drive.read("openstack/latest/user_data"),
            Some(expected.as_bytes())
        );
    }
    assert!(mock.config_drive_for("worker-0").is_none());

    // Only the plan itself is left behind in the staging directory
    let leftovers: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec!["plan.yaml"]);
}

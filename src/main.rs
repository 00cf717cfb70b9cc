//! baremetal-deploy - drive Ironic nodes to active
//!
//! Deploys every node of a plan concurrently against a `noauth` Ironic and
//! builds or inspects the config drives it would send.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber, filter::LevelFilter};

use baremetal_deploy::config::{self, Settings, loader};
use baremetal_deploy::configdrive::{self, ConfigDrive, ConfigDriveBuilder};
use baremetal_deploy::{IronicClient, NodeClient, Progress, run_all};

#[derive(Parser)]
#[command(name = "baremetal-deploy")]
#[command(author, version, about = "Deploy bare metal nodes through Ironic", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file
    #[arg(
        short,
        long,
        env = "BAREMETAL_DEPLOY_CONFIG",
        default_value = "baremetal-deploy.yaml",
        global = true
    )]
    config: PathBuf,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that can be overridden from the command line or environment
#[derive(Args)]
struct Overrides {
    /// Ironic API endpoint
    #[arg(long, env = "IRONIC_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// Ironic API microversion
    #[arg(long, env = "IRONIC_API_VERSION", global = true)]
    microversion: Option<String>,

    /// Seconds between two polls of a node
    #[arg(long, global = true)]
    poll_interval: Option<u64>,

    /// Seconds a single wait may take (0 waits forever)
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

impl Overrides {
    fn apply(self, settings: &mut Settings) {
        if let Some(endpoint) = self.endpoint {
            settings.ironic.endpoint = endpoint;
        }
        if let Some(microversion) = self.microversion {
            settings.ironic.microversion = microversion;
        }
        if let Some(interval) = self.poll_interval {
            settings.polling.interval_secs = interval;
        }
        if let Some(timeout) = self.timeout {
            settings.polling.timeout_secs = timeout;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy every node of a plan
    Deploy {
        /// Deployment plan
        #[arg(short, long)]
        plan: PathBuf,
    },
    /// Build a config drive and print it base64 encoded
    BuildConfigDrive {
        /// Take the drive from this plan
        #[arg(long, requires = "node")]
        plan: Option<PathBuf>,

        /// Node of the plan whose drive to build
        #[arg(long, requires = "plan")]
        node: Option<String>,

        /// User data file, copied verbatim
        #[arg(long, conflicts_with = "plan")]
        user_data: Option<PathBuf>,

        /// JSON file with the instance metadata
        #[arg(long, conflicts_with = "plan")]
        meta_data: Option<PathBuf>,

        /// JSON file with the network data
        #[arg(long, conflicts_with = "plan")]
        network_data: Option<PathBuf>,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the files inside a base64 encoded config drive
    InspectConfigDrive {
        /// File holding the drive, or - for stdin
        input: String,
    },
}

fn init_logging(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut settings = loader::load_settings(&cli.config)
        .await
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    cli.overrides.apply(&mut settings);

    match cli.command {
        Commands::Deploy { plan } => deploy(&settings, &plan).await,
        Commands::BuildConfigDrive {
            plan,
            node,
            user_data,
            meta_data,
            network_data,
            output,
        } => {
            let drive = match (plan, node) {
                (Some(plan), Some(node)) => drive_from_plan(&plan, &node).await?,
                _ => drive_from_files(user_data, meta_data, network_data).await?,
            };

            let mut builder = ConfigDriveBuilder::new();
            if let Some(staging_dir) = &settings.staging_dir {
                builder = builder.with_staging_root(staging_dir);
            }
            let encoded = builder.build(&drive).await?;

            match output {
                Some(path) => {
                    tokio::fs::write(&path, &encoded)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!("Wrote config drive to {}", path.display());
                }
                None => println!("{}", encoded),
            }
            Ok(())
        }
        Commands::InspectConfigDrive { input } => inspect(&input).await,
    }
}

async fn deploy(settings: &Settings, plan_path: &Path) -> Result<()> {
    let plan = config::load_plan(plan_path).await?;
    if plan.nodes.is_empty() {
        warn!("Plan {} has no nodes", plan_path.display());
        return Ok(());
    }

    let client: Arc<dyn NodeClient> = Arc::new(
        IronicClient::from_settings(&settings.ironic).context("creating Ironic client")?,
    );
    info!(
        "Deploying {} nodes through {}",
        plan.nodes.len(),
        settings.ironic.endpoint
    );

    let cancel = CancellationToken::new();
    let mut deployments = Vec::with_capacity(plan.nodes.len());
    let mut watchers = Vec::with_capacity(plan.nodes.len());

    for deployment in loader::build_deployments(&plan, settings).await? {
        let (tx, mut rx) = mpsc::unbounded_channel::<Progress>();
        let node = deployment.node_id().to_string();

        watchers.push(tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                info!("[{}] {} {}%", node, progress.state, progress.percent);
            }
        }));
        deployments.push(
            deployment
                .with_progress(tx)
                .with_cancellation(cancel.clone()),
        );
    }

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling deployments");
            interrupt.cancel();
        }
    });

    let reports = run_all(client, deployments).await;
    join_watchers(watchers).await;

    let mut failed = 0;
    for report in &reports {
        match &report.result {
            Ok(()) => info!("{}: active", report.node_id),
            Err(e) => {
                failed += 1;
                error!("{}: {}", report.node_id, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} deployments failed", failed, reports.len());
    }
    info!("All {} nodes deployed", reports.len());
    Ok(())
}

/// Wait for every progress watcher, returning how many of them failed
async fn join_watchers(watchers: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for watcher in watchers {
        if let Err(e) = watcher.await {
            warn!("Progress watcher failed: {}", e);
            failed += 1;
        }
    }
    failed
}

async fn drive_from_plan(plan_path: &Path, node_id: &str) -> Result<ConfigDrive> {
    let plan = config::load_plan(plan_path).await?;
    let node = plan
        .node(node_id)
        .with_context(|| format!("node {} is not in {}", node_id, plan_path.display()))?;

    Ok(loader::resolve_config_drive(&node.config_drive, &plan.base_dir).await?)
}

async fn drive_from_files(
    user_data: Option<PathBuf>,
    meta_data: Option<PathBuf>,
    network_data: Option<PathBuf>,
) -> Result<ConfigDrive> {
    let mut drive = ConfigDrive::new();

    if let Some(path) = user_data {
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        drive = drive.with_user_data(data);
    }
    if let Some(path) = meta_data {
        drive = drive.with_meta_data(read_json_object(&path).await?);
    }
    if let Some(path) = network_data {
        drive = drive.with_network_data(read_json_object(&path).await?);
    }

    if drive.is_empty() {
        warn!("Building an empty config drive");
    }
    Ok(drive)
}

async fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    match serde_json::from_str::<Value>(&content)
        .with_context(|| format!("parsing {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => bail!("{} must contain a JSON object", path.display()),
    }
}

async fn inspect(input: &str) -> Result<()> {
    let encoded = if input == "-" {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("reading stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("reading {}", input))?
    };

    let image = configdrive::decode(&encoded)?;
    println!("volume: {}", image.volume_id());
    if !image.has_rock_ridge() {
        warn!("No Rock Ridge names, showing mapped ISO-9660 identifiers");
    }
    for (path, size) in image.root().list() {
        println!("{:>8}  {}", size, path);
    }
    Ok(())
}

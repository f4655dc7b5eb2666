//! CSI Sanity preflight
//!
//! Runs the session lifecycle once against a CSI plugin: connects to its
//! endpoints, provisions the mount and staging paths and removes them
//! again. Exits non-zero when any step fails.

use std::process::ExitCode;

use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use csi_sanity::config::{DEFAULT_PATH_CMD_TIMEOUT_SECS, DEFAULT_TEST_VOLUME_SIZE};
use csi_sanity::metrics;
use csi_sanity::provision::BoxError;
use csi_sanity::{Config, PathHooks, SanityContext, Suite, TestCase};

/// CLI arguments for the sanity harness
#[derive(Parser, Debug)]
#[command(name = "csi-sanity")]
#[command(about = "Lifecycle preflight for CSI plugin conformance tests")]
struct Args {
    /// CSI node endpoint (unix socket path or host:port)
    #[arg(long, env = "CSI_ENDPOINT")]
    endpoint: String,

    /// CSI controller endpoint; defaults to the node endpoint
    #[arg(long, env = "CSI_CONTROLLER_ENDPOINT", default_value = "")]
    controller_endpoint: String,

    /// Mount target directory
    #[arg(long, default_value = "/tmp/csi-mount")]
    mount_dir: String,

    /// Staging directory
    #[arg(long, default_value = "/tmp/csi-staging")]
    staging_dir: String,

    /// YAML file with secrets per CSI operation
    #[arg(long, env = "CSI_SECRETS", default_value = "")]
    secrets: String,

    /// Size of test volumes in bytes
    #[arg(long, default_value_t = DEFAULT_TEST_VOLUME_SIZE)]
    test_volume_size: i64,

    /// YAML file with parameters for test volumes
    #[arg(long, default_value = "")]
    test_volume_parameters: String,

    /// Verify the node reports a volume attach limit
    #[arg(long, default_value = "false")]
    test_node_volume_attach_limit: bool,

    /// Command that creates the mount target path and prints it
    #[arg(long, default_value = "")]
    create_mount_path_cmd: String,

    /// Command that creates the staging path and prints it
    #[arg(long, default_value = "")]
    create_staging_path_cmd: String,

    /// Timeout in seconds for the path creation commands
    #[arg(long, default_value_t = DEFAULT_PATH_CMD_TIMEOUT_SECS)]
    create_path_cmd_timeout: u64,

    /// Command that removes the mount target path
    #[arg(long, default_value = "")]
    remove_mount_path_cmd: String,

    /// Command that removes the staging path
    #[arg(long, default_value = "")]
    remove_staging_path_cmd: String,

    /// Timeout in seconds for the path removal commands
    #[arg(long, default_value_t = DEFAULT_PATH_CMD_TIMEOUT_SECS)]
    remove_path_cmd_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            target_path: self.mount_dir,
            staging_path: self.staging_dir,
            address: self.endpoint,
            controller_address: self.controller_endpoint,
            secrets_file: self.secrets,
            test_volume_size: self.test_volume_size,
            test_volume_parameters_file: self.test_volume_parameters,
            test_node_volume_attach_limit: self.test_node_volume_attach_limit,
            create_target_path: PathHooks::with_command(
                self.create_mount_path_cmd,
                self.create_path_cmd_timeout,
            ),
            create_staging_path: PathHooks::with_command(
                self.create_staging_path_cmd,
                self.create_path_cmd_timeout,
            ),
            remove_target_path: PathHooks::with_command(
                self.remove_mount_path_cmd,
                self.remove_path_cmd_timeout,
            ),
            remove_staging_path: PathHooks::with_command(
                self.remove_staging_path_cmd,
                self.remove_path_cmd_timeout,
            ),
            ..Config::default()
        }
    }
}

/// Everything setup promised is in place.
async fn preflight(ctx: &mut SanityContext) -> Result<(), BoxError> {
    if ctx.conn().is_none() {
        return Err("node connection not established".into());
    }
    if ctx.controller_conn().is_none() {
        return Err("controller connection not established".into());
    }

    for (location, path) in [("target", ctx.target_path()), ("staging", ctx.staging_path())] {
        if path.is_empty() {
            continue;
        }
        if !tokio::fs::try_exists(path).await? {
            return Err(format!("{} path {} does not exist after setup", location, path).into());
        }
    }

    info!(
        node = ?ctx.connections().node_address(),
        controller = ?ctx.connections().controller_address(),
        target_path = %ctx.target_path(),
        staging_path = %ctx.staging_path(),
        volume_name = %ctx.unique_string("sanity"),
        "environment ready"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let config = args.into_config();
    info!(
        endpoint = %config.address,
        controller_endpoint = %config.controller_address,
        target_path = %config.target_path,
        staging_path = %config.staging_path,
        "Starting CSI sanity preflight"
    );

    // A broken parameters file is fatal before any case runs
    let mut suite = Suite::from_config("CSI Driver Test Suite", config)
        .await
        .map_err(|e| format!("Startup failed: {}", e))?;
    suite.add(TestCase::new("environment preflight", |ctx| {
        Box::pin(preflight(ctx))
    }));

    let report = suite.run().await;
    if report.success() {
        info!(passed = report.passed(), "all test cases passed");
        Ok(ExitCode::SUCCESS)
    } else {
        error!(failed = report.failed(), "test cases failed");
        Ok(ExitCode::FAILURE)
    }
}

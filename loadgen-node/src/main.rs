use anyhow::{Context, Result};
use clap::Parser;
use loadgen_node::metrics::{ProfileMetrics, HTTP_REQ_FAILED, ITERATIONS, VUS_MAX};
use loadgen_node::report::{EXIT_CONFIGURATION, EXIT_PASSED};
use loadgen_node::{Harness, LoadgenConfig, LoadgenError, ProfileRegistry, ReqwestTransport};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Virtual-user load generator for markdown APIs
#[derive(Debug, Parser)]
#[command(name = "loadgen-node", version, about)]
struct Cli {
    /// Configuration file (TOML), extension optional
    #[arg(long, default_value = "config/default")]
    config: String,

    /// Profile key, overrides CLIENT and the config file
    #[arg(long)]
    profile: Option<String>,

    /// Operation key or `all`, overrides OP and the config file
    #[arg(long)]
    op: Option<String>,

    /// Profile catalog path
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Summary JSON output path
    #[arg(long)]
    summary: Option<String>,

    /// Resolve the profile and load the dataset, then print the plan without sending anything
    #[arg(long)]
    dry_run: bool,
}

fn load_config(cli: &Cli) -> loadgen_node::Result<LoadgenConfig> {
    let mut config = LoadgenConfig::from_file(&cli.config)?;
    config.apply_env_overrides()?;

    if let Some(profile) = &cli.profile {
        config.run.profile = profile.trim().to_lowercase();
    }
    if let Some(op) = &cli.op {
        config.run.operation = op.trim().to_lowercase();
    }
    if let Some(catalog) = &cli.catalog {
        config.run.catalog = catalog.display().to_string();
    }
    if let Some(summary) = &cli.summary {
        config.output.summary_json = Some(summary.clone());
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &LoadgenConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Initialize metrics descriptions
fn initialize_metrics(names: &ProfileMetrics, operations: &[String]) {
    describe_histogram!(
        names.req_duration.clone(),
        "Request duration across operations in milliseconds"
    );
    for op in operations {
        describe_histogram!(
            names.operation_duration(op),
            "Request duration of one operation in milliseconds"
        );
    }
    describe_counter!(
        names.error_rate.clone(),
        "Operations by failure flag (value=true is a failure)"
    );
    describe_counter!(names.retries.clone(), "Retries after retryable failures");
    describe_histogram!(names.req_bytes.clone(), "Request body size in bytes");
    describe_histogram!(names.res_bytes.clone(), "Response body size in bytes");
    describe_counter!(HTTP_REQ_FAILED, "Attempt chains by failure flag");
    describe_counter!(ITERATIONS, "Completed VU iterations");
    describe_gauge!(VUS_MAX, "Active virtual users");
}

fn start_metrics_exporter(config: &LoadgenConfig) -> Result<()> {
    let listen_addr = config.metrics_addr()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(metrics_addr = %listen_addr, "Prometheus metrics exporter started");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&LoadgenConfig::default());
            error!(error = %e, "Invalid configuration");
            std::process::exit(EXIT_CONFIGURATION);
        }
    };
    init_tracing(&config);

    info!("Starting Loadgen Node v{}", env!("CARGO_PKG_VERSION"));

    let registry = match ProfileRegistry::from_file(&config.catalog_path()) {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, catalog = %config.run.catalog, "Failed to load profile catalog");
            std::process::exit(EXIT_CONFIGURATION);
        }
    };
    info!(profiles = ?registry.keys().collect::<Vec<_>>(), "Profile catalog loaded");

    let transport = ReqwestTransport::new(config.http.max_redirects)
        .context("Failed to build HTTP transport")?;
    let harness = Harness::new(config.clone(), registry, Arc::new(transport));

    let prepared = match harness.prepare() {
        Ok(prepared) => prepared,
        Err(e) => {
            report_configuration_error(&e);
            std::process::exit(EXIT_CONFIGURATION);
        }
    };

    if cli.dry_run {
        prepared.plan().log();
        std::process::exit(EXIT_PASSED);
    }

    if config.metrics.enabled {
        start_metrics_exporter(&config)?;
        let operations: Vec<String> = prepared
            .operations()
            .iter()
            .map(|op| op.key.clone())
            .collect();
        initialize_metrics(&ProfileMetrics::new(&prepared.profile().name), &operations);
    }

    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, stopping VUs");
                ctrl_c.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupt"),
        }
    });

    let summary = prepared.execute(stop).await;
    summary.log();
    if let Err(e) = summary.write_outputs(&config.output) {
        error!(error = %e, "Failed to write run outputs");
    }

    std::process::exit(summary.exit_code());
}

fn report_configuration_error(e: &LoadgenError) {
    match e {
        LoadgenError::MissingToken { profile, env_key } => error!(
            profile = %profile,
            env_key = %env_key,
            "No token. Provide {}=<JWT or 'Bearer ...'>",
            env_key
        ),
        LoadgenError::EmptyDataset { location } => error!(
            dataset = %location,
            "No rows loaded, no requests will be sent"
        ),
        other => error!(error = %other, configuration = other.is_configuration(), "Run cannot start"),
    }
}

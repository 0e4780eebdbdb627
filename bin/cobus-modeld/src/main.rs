//! ---
//! cobus_section: "07-binaries"
//! cobus_subsection: "binary"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Binary entrypoint for the model runner daemon."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cobus_common::config::{BusOptions, DescriptorSet, DEFAULT_MODEL_TIMEOUT_SECS};
use cobus_common::logging::init_tracing;
use cobus_model::{behavior_for, ModelRuntime};
use cobus_transport::create_endpoint;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about = "Co-simulation model runner", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 2, help = "Log level (0=trace .. 5=off)")]
    logger: u8,

    #[arg(long, help = "Model step size in seconds")]
    stepsize: Option<f64>,

    #[arg(long, help = "Simulation end time in seconds")]
    endtime: Option<f64>,

    #[arg(long, help = "Transport family (unix, redis, posix, loopback)")]
    transport: Option<String>,

    #[arg(long, help = "Transport URI, e.g. redis://localhost:6379")]
    uri: Option<String>,

    #[arg(long, help = "Model instance name in the stack")]
    name: String,

    #[arg(long, help = "Wait-message timeout in seconds")]
    timeout: Option<f64>,

    #[arg(required = true, value_name = "DESCRIPTOR", help = "Descriptor file paths")]
    descriptors: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("cobus-modeld", cli.logger);

    let descriptors = DescriptorSet::load(&cli.descriptors).context("loading descriptors")?;
    let topology = descriptors
        .model_topology(&cli.name)
        .context("deriving model topology")?;

    let mut options = BusOptions::model(&cli.name);
    options.uid = topology.uid;
    options.transport = cli.transport.clone();
    if let Some(uri) = &cli.uri {
        options.uri = uri.clone();
    }
    if let Some(step_size) = cli.stepsize {
        options.step_size = step_size;
    } else if let Some(spec) = &topology.behavior {
        if let Some(step_size) = spec.step_size {
            options.step_size = step_size;
        }
    }
    options.end_time = cli.endtime;
    options.timeout =
        Duration::from_secs_f64(cli.timeout.unwrap_or(DEFAULT_MODEL_TIMEOUT_SECS).max(0.001));

    info!("Transport:");
    info!("  transport: {}", options.transport.as_deref().unwrap_or("(from uri)"));
    info!("  uri: {}", options.uri);
    info!(
        model_uid = topology.uid,
        model_name = %topology.name,
        step_size = options.step_size,
        "model instance resolved"
    );

    let Some(spec) = topology.behavior.clone() else {
        error!(
            error_class = "ConfigError",
            instance = %cli.name,
            "no model descriptor selects a behavior for this instance"
        );
        bail!("instance '{}' has no model behavior", cli.name);
    };
    let behavior = behavior_for(&spec.behavior, &topology).context("selecting behavior")?;

    let endpoint = create_endpoint(
        options.transport.as_deref(),
        &options.uri,
        options.uid,
        false,
        options.timeout,
    )
    .await
    .context("creating model endpoint")?;

    let runtime = ModelRuntime::new(endpoint, topology, options, behavior);
    let summary = runtime.run().await.map_err(|err| {
        error!(error = %err, "model run failed");
        anyhow::anyhow!(err)
    })?;
    info!(
        steps = summary.steps,
        model_time = summary.model_time,
        "model completed cleanly"
    );
    Ok(())
}

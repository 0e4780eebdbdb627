//! ---
//! cobus_section: "07-binaries"
//! cobus_subsection: "binary"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Binary entrypoint for the bus daemon."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cobus_common::config::{
    BusOptions, BusTopology, ChannelTopology, ConfigError, DescriptorSet, BUS_MODEL_UID,
    DEFAULT_BUS_TIMEOUT_SECS, FALLBACK_CHANNEL,
};
use cobus_common::logging::init_tracing;
use cobus_coordinator::{Bus, BusError, BusSummary};
use cobus_transport::{create_endpoint, TransportError};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Endpoint creation retries before the startup is declared failed.
const ENDPOINT_RETRY_COUNT: u32 = 60;

#[derive(Debug, Parser)]
#[command(author, version, about = "Standalone co-simulation bus", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 2, help = "Log level (0=trace .. 5=off)")]
    logger: u8,

    #[arg(long, help = "Bus step size in seconds")]
    stepsize: Option<f64>,

    #[arg(long, help = "Simulation end time in seconds")]
    endtime: Option<f64>,

    #[arg(long, help = "Transport family (unix, redis, posix, loopback)")]
    transport: Option<String>,

    #[arg(long, help = "Transport URI, e.g. redis://localhost:6379")]
    uri: Option<String>,

    #[arg(long, default_value = "simbus", help = "Bus instance name in the stack")]
    name: String,

    #[arg(long, help = "Wait-message timeout in seconds")]
    timeout: Option<f64>,

    #[arg(required = true, value_name = "DESCRIPTOR", help = "Descriptor file paths")]
    descriptors: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("cobusd", cli.logger);

    let mut options = BusOptions::bus(&cli.name);
    options.uid = BUS_MODEL_UID;
    options.transport = cli.transport.clone();
    if let Some(uri) = &cli.uri {
        options.uri = uri.clone();
    }
    if let Some(step_size) = cli.stepsize {
        options.step_size = step_size;
    }
    options.end_time = cli.endtime;
    let timeout_secs = cli.timeout.unwrap_or(DEFAULT_BUS_TIMEOUT_SECS);
    options.timeout = Duration::from_secs_f64(if timeout_secs > 0.0 {
        timeout_secs
    } else {
        DEFAULT_BUS_TIMEOUT_SECS
    });

    info!("Transport:");
    info!("  transport: {}", options.transport.as_deref().unwrap_or("(from uri)"));
    info!("  uri: {}", options.uri);

    let descriptors = DescriptorSet::load(&cli.descriptors).context("loading descriptors")?;
    let topology = bus_topology_or_fallback(&descriptors, &options.name)?;
    for (name, channel) in &topology.channels {
        info!(
            "  Channel: {} (expected models={})",
            name, channel.expected_model_count
        );
    }

    let (shutdown_tx, _) = broadcast::channel(16);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("termination signal received; shutting down bus");
        let _ = signal_tx.send(());
    });

    info!("Start the Bus ...");
    let summary = run_bus(options, &topology, &shutdown_tx).await?;
    info!(
        cycles = summary.cycles,
        bus_time = summary.bus_time,
        "bus completed cleanly"
    );
    Ok(())
}

/// Run the bus, retrying endpoint startup while the transport side is not
/// up yet (a broker that has not finished starting, for instance).
async fn run_bus(
    options: BusOptions,
    topology: &BusTopology,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<BusSummary> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let endpoint = create_endpoint(
            options.transport.as_deref(),
            &options.uri,
            options.uid,
            true,
            options.timeout,
        )
        .await
        .context("creating bus endpoint")?;
        let bus = Bus::new(endpoint, topology, options.clone(), None)
            .context("composing bus")?;

        match bus.run(shutdown_tx.subscribe()).await {
            Ok(summary) => return Ok(summary),
            Err(BusError::Transport(TransportError::ConnectionRefused { uri, reason }))
                if attempt < ENDPOINT_RETRY_COUNT =>
            {
                warn!(uri = %uri, reason = %reason, attempt, "Retry endpoint creation ...");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(err) => {
                error!(error = %err, "bus run failed");
                return Err(err.into());
            }
        }
    }
}

fn bus_topology_or_fallback(
    descriptors: &DescriptorSet,
    instance: &str,
) -> Result<BusTopology> {
    match descriptors.bus_topology(instance) {
        Ok(topology) if !topology.channels.is_empty() => Ok(topology),
        Ok(_) | Err(ConfigError::MissingStack) | Err(ConfigError::UnknownInstance(_)) => {
            // Same fallback the harness relies on when a stack carries no
            // channel configuration: one channel, one expected model.
            error!("No channel configuration found, fallback ...");
            error!("  Channel: {} (expected models=1)", FALLBACK_CHANNEL);
            let mut channels = indexmap::IndexMap::new();
            channels.insert(
                FALLBACK_CHANNEL.to_owned(),
                ChannelTopology {
                    expected_model_count: 1,
                    signals: indexmap::IndexMap::new(),
                },
            );
            Ok(BusTopology { channels })
        }
        Err(err) => {
            error!(error = %err, error_class = "ConfigError", "descriptor validation failed");
            Err(err.into())
        }
    }
}

/// Shared graceful shutdown helper used by both daemons. Keeping this logic
/// identical across binaries makes operational behaviour predictable.
#[cfg(unix)]
async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {},
        _ = async {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            term.recv().await;
        } => {},
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {},
    }
}

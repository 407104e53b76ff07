//! vpnv4-agentd - per-namespace BGP VPNv4 export agent

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vpnv4_agentd::config::DEFAULT_CONFIG_PATH;
use vpnv4_agentd::{
    source, AgentConfig, DaemonOps, Engine, EngineSettings, FrrDaemon, IpKernel,
    JsonFileController, KernelOps, LoggingController, NetworkController, RouteImporter,
    TenantStore,
};

/// Bound of the source → engine queue
const QUEUE_DEPTH: usize = 256;

/// Agent exporting per-namespace prefixes as BGP VPNv4 VRFs
#[derive(Parser, Debug)]
#[command(name = "vpnv4-agentd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,

    /// Poll every source once, reconcile, and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    info!("--- Starting vpnv4-agentd ---");

    match run(args).await {
        Ok(()) => {
            info!("vpnv4-agentd exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "vpnv4-agentd exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(true))
        .init();
}

async fn run(args: Args) -> Result<()> {
    let config = AgentConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let driver = &config.driver;
    info!(
        path = %args.config.display(),
        local_asn = driver.local_asn,
        neighbours = driver.neighbours.len(),
        watchers = config.watchers.len(),
        "Configuration loaded"
    );
    if config.watchers.is_empty() {
        warn!("No watchers configured, no tenants will be exported");
    }

    let kernel: Arc<dyn KernelOps> = if driver.kernel_vrf_support {
        Arc::new(IpKernel::new(driver.command_timeout()).with_ipv6(driver.export_ipv6))
    } else {
        warn!("Kernel VRF support disabled, VRF devices and blackhole routes will not be managed");
        Arc::new(IpKernel::disabled(driver.command_timeout()))
    };
    let daemon: Arc<dyn DaemonOps> = Arc::new(FrrDaemon::new(
        &driver.frr_config_path,
        &driver.reload_command,
        driver.command_timeout(),
    ));

    let store = TenantStore::new(driver.allocator_settings(), driver.maintain_empty_vrf);
    let mut engine = Engine::new(store, EngineSettings::from(&config), kernel.clone(), daemon);
    let mut sources = source::from_config(&config.watchers);

    if args.once {
        let batches = source::poll_all(&mut sources).await;
        let report = engine.run_cycle(batches, true).await?;
        info!(
            tenants = engine.store().len(),
            kernel_ops = report.kernel_ops,
            "Single reconciliation finished"
        );
        if report.pending {
            bail!("reconciliation left work pending ({} degraded VRFs)", engine.degraded().len());
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let mut tasks = Vec::new();
    for src in sources {
        tasks.push(source::spawn_source(src, tx.clone(), cancel.clone()));
    }
    // Held so the engine keeps running when no watcher is configured
    let _keepalive = tx;

    if config.importer.enabled {
        let controller: Arc<dyn NetworkController> = match &config.importer.export_path {
            Some(path) => Arc::new(JsonFileController::new(path)),
            None => Arc::new(LoggingController),
        };
        let importer = RouteImporter::new(kernel, controller);
        tasks.push(tokio::spawn(importer.run(
            engine.subscribe(),
            config.importer.interval(),
            cancel.clone(),
        )));
    }

    let result = engine.run(rx, cancel.clone()).await;

    // A fatal engine error stops everything else too
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }

    result.context("reconciliation engine failed")
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
    Ok(())
}

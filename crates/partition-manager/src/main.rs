mod logging;

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use partition_manager::config::Cli;
use partition_manager::config::Commands;
use partition_manager::config::DaemonArgs;
use partition_manager::config::LayoutArgs;
use partition_manager::driver::NvmlDriver;
use partition_manager::ManagerConfig;
use partition_manager::PartitionManager;
use tokio_util::sync::CancellationToken;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::SaveLayout(layout_args) => run_save_layout(layout_args).await,
        Commands::ApplyLayout(layout_args) => run_apply_layout(layout_args).await,
    }
}

async fn init_manager(
    nvml_lib_path: Option<&std::path::Path>,
    config: ManagerConfig,
) -> Result<Arc<PartitionManager>> {
    let lib_path = nvml_lib_path.map(|p| p.as_os_str().to_owned());
    let driver = tokio::task::spawn_blocking(move || NvmlDriver::init(lib_path.as_deref()))
        .await
        .context("NVML init task failed")?
        .context("failed to initialize NVML")?;

    PartitionManager::init(Arc::new(driver), config)
        .await
        .context("failed to initialize partition manager")
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.telemetry_log.as_deref())?;

    tracing::info!("Starting partitiond {}", env!("CARGO_PKG_VERSION"));

    let config = ManagerConfig {
        start_monitoring: false,
        ..ManagerConfig::from(&daemon_args)
    };
    let manager = init_manager(daemon_args.nvml_lib_path.as_deref(), config).await?;

    if let Some(layout) = &daemon_args.layout {
        apply_and_wait(&manager, layout).await?;
    }

    let token = CancellationToken::new();
    let emitter = tokio::spawn(emit_telemetry(manager.clone(), token.clone()));

    if daemon_args.monitoring {
        manager
            .start_monitoring(manager.config().refresh_interval)
            .await?;
    }

    wait_for_signal().await?;

    token.cancel();
    if let Err(e) = emitter.await {
        tracing::error!("Telemetry emitter failed: {e}");
    }
    manager.shutdown().await;
    Ok(())
}

async fn run_save_layout(args: LayoutArgs) -> Result<()> {
    utils::logging::init();

    let config = ManagerConfig {
        start_monitoring: false,
        ..Default::default()
    };
    let manager = init_manager(args.nvml_lib_path.as_deref(), config).await?;
    let result = manager
        .save_layout(&args.path)
        .await
        .with_context(|| format!("failed to save layout to {}", args.path.display()));
    manager.shutdown().await;
    result
}

async fn run_apply_layout(args: LayoutArgs) -> Result<()> {
    utils::logging::init();

    let config = ManagerConfig {
        start_monitoring: false,
        ..Default::default()
    };
    let manager = init_manager(args.nvml_lib_path.as_deref(), config).await?;
    let result = apply_and_wait(&manager, &args.path).await;
    manager.shutdown().await;
    result
}

/// Applies a layout and waits for every queued step.
async fn apply_and_wait(manager: &PartitionManager, path: &std::path::Path) -> Result<()> {
    let tickets = manager
        .apply_layout(path)
        .await
        .with_context(|| format!("failed to apply layout {}", path.display()))?;

    let mut failed = 0;
    for ticket in tickets {
        let label = ticket.label().to_string();
        match ticket.wait().await {
            Ok(report) => tracing::info!(step = %label, "{}", report.message),
            Err(e) => {
                failed += 1;
                tracing::error!(step = %label, error = %e, "layout step failed");
            }
        }
    }
    anyhow::ensure!(failed == 0, "{failed} layout steps failed");
    Ok(())
}

/// Logs one telemetry line per partition after every refresh cycle.
async fn emit_telemetry(manager: Arc<PartitionManager>, token: CancellationToken) {
    let mut updates = manager.subscribe().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            update = updates.recv() => {
                if update.is_none() {
                    break;
                }
            }
        }

        let samples = match manager.all_metrics().await {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!("Failed to collect partition telemetry: {e}");
                continue;
            }
        };
        for partition in manager.all_partitions().await {
            let Some(sample) = samples.get(&partition.identity) else {
                continue;
            };
            tracing::info!(
                target: "metrics.partition",
                tag_identity = %partition.identity,
                tag_device = partition.device_index,
                tag_profile = partition.profile_id,
                compute_utilization = sample.compute_utilization,
                memory_utilization = sample.memory_utilization,
                memory_used = sample.memory_used,
                memory_total = sample.memory_total,
                power_usage = sample.power_usage,
                temperature = sample.temperature,
                processes = sample.process_memory.len(),
            );
        }
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    }
    Ok(())
}

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "PARTITIOND_REFRESH_INTERVAL_MS",
        default_value = "1000",
        help = "Milliseconds between partition cache and telemetry refreshes"
    )]
    pub refresh_interval_ms: u64,

    #[arg(
        long,
        default_value = "64",
        help = "Maximum number of queued partition mutations"
    )]
    pub queue_capacity: usize,

    #[arg(
        long,
        help = "Start the refresh loop on startup",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub monitoring: bool,

    #[arg(
        long,
        env = "PARTITIOND_TELEMETRY_LOG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path for partition telemetry lines, e.g. /logs/partitions.log"
    )]
    pub telemetry_log: Option<PathBuf>,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Layout file to apply before monitoring starts"
    )]
    pub layout: Option<PathBuf>,

    #[arg(
        long,
        env = "PARTITIOND_NVML_LIB_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Explicit path to libnvidia-ml, e.g. /usr/lib/x86_64-linux-gnu/libnvidia-ml.so.1"
    )]
    pub nvml_lib_path: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct LayoutArgs {
    #[arg(value_hint = clap::ValueHint::FilePath, help = "Layout JSON file")]
    pub path: PathBuf,

    #[arg(
        long,
        env = "PARTITIOND_NVML_LIB_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Explicit path to libnvidia-ml"
    )]
    pub nvml_lib_path: Option<PathBuf>,
}

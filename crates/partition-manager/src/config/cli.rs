use clap::Parser;
use clap::Subcommand;

use crate::config::daemon::DaemonArgs;
use crate::config::daemon::LayoutArgs;

#[derive(Parser)]
#[command(about, long_about, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the partition manager daemon
    Daemon(Box<DaemonArgs>),
    /// Write the current partition layout to a file
    #[command(name = "save-layout")]
    SaveLayout(LayoutArgs),
    /// Reconcile devices with a saved partition layout
    #[command(name = "apply-layout")]
    ApplyLayout(LayoutArgs),
}

//! Command-line argument parsing.

use clap::Parser;

/// Waterfall workflow node - backup/restore lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "waterfall-node")]
#[command(about = "Waterfall workflow node - backup/restore lifecycle manager")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "WATERFALL_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "WATERFALL_LOG_LEVEL")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Hostname this node registers under (auto-detected if not provided)
    #[arg(long)]
    pub hostname: Option<String>,

    /// Backend name, the part after '@' in the host string
    #[arg(long)]
    pub backend: Option<String>,

    /// Directory the simple driver stores backups in
    #[arg(long)]
    pub backup_path: Option<String>,

    /// Highest RPC version to send, e.g. "1.3" during a rolling upgrade
    #[arg(long)]
    pub rpc_version_cap: Option<String>,

    /// Resume interrupted deletes in the background
    #[arg(long)]
    pub offload_deletes: bool,

    /// Enable development mode (mock driver and connector)
    #[arg(long)]
    pub dev: bool,
}

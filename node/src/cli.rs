//! # CLI Interface
//!
//! Command-line arguments of `ntkd`, built with `clap` derive. Every `run`
//! flag can also come from an `NTK_*` environment variable.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use ntk_protocol::config::DEFAULT_NTK_PORT;

/// Netsukuku mesh node.
///
/// Discovers neighbors, keeps the hierarchical maps of the node in sync
/// with QSPN and hands route changes to the kernel.
#[derive(Parser, Debug)]
#[command(name = "ntkd", about = "Netsukuku mesh node", version, propagate_version = true)]
pub struct NtkdCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Print the persisted maps as JSON.
    Dump(DumpArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Address of this node.
    #[arg(long, short = 'a', env = "NTK_ADDRESS")]
    pub address: IpAddr,

    /// Interfaces the radar probes, comma separated.
    #[arg(long = "iface", short = 'i', env = "NTK_IFACES", value_delimiter = ',', required = true)]
    pub ifaces: Vec<String>,

    /// Optional JSON file with protocol tunables.
    #[arg(long, short = 'c', env = "NTK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the map database.
    #[arg(long, short = 'd', env = "NTK_DATA_DIR", default_value = "/var/lib/ntkd")]
    pub data_dir: PathBuf,

    /// UDP port of the protocol.
    #[arg(long, env = "NTK_PORT", default_value_t = DEFAULT_NTK_PORT)]
    pub port: u16,

    /// Port of the HTTP status and metrics endpoint.
    #[arg(long, env = "NTK_API_PORT", default_value_t = 9269)]
    pub api_port: u16,

    /// Overrides the number of echo probes per scan.
    #[arg(long, env = "NTK_RADAR_SCANS")]
    pub radar_scans: Option<usize>,

    /// Overrides the pause between two radar scans, in milliseconds.
    #[arg(long, env = "NTK_SCAN_INTERVAL_MS")]
    pub scan_interval_ms: Option<u64>,

    /// Skip hooking and trust the stored maps.
    #[arg(long, env = "NTK_RESTORE")]
    pub restore: bool,

    #[arg(long, env = "NTK_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,
}

/// Arguments for the `dump` subcommand.
#[derive(Parser, Debug)]
pub struct DumpArgs {
    /// Address the maps were saved under.
    #[arg(long, short = 'a', env = "NTK_ADDRESS")]
    pub address: IpAddr,

    #[arg(long, short = 'd', env = "NTK_DATA_DIR", default_value = "/var/lib/ntkd")]
    pub data_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        NtkdCli::command().debug_assert();
    }

    #[test]
    fn interfaces_split_on_commas() {
        let cli = NtkdCli::parse_from(["ntkd", "run", "-a", "10.0.0.1", "-i", "eth0,wlan0"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.ifaces, vec!["eth0".to_string(), "wlan0".to_string()]);
        assert_eq!(args.port, DEFAULT_NTK_PORT);
        assert_eq!(args.log_format, LogFormatArg::Pretty);
    }
}

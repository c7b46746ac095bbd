use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use webhook_tunnel_common::constants::{
    DEFAULT_LOG_MAX_ENTRIES, DEFAULT_LOG_MAX_SIZE, DEFAULT_REQUEST_TIMEOUT_SECS,
};

/// CLI arguments for the tunnel server
#[derive(Parser, Debug)]
#[command(name = "wts")]
#[command(about = "Webhook tunnel server", long_about = None)]
#[command(version)]
pub struct Args {
    /// Address to listen on
    #[arg(short, long, env = "WTS_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: String,

    /// Folder for recorded request and response bodies
    #[arg(short, long, env = "WTS_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Bearer token agents must present on the tunnel stream
    #[arg(long, env = "WTS_AGENT_KEY")]
    pub agent_key: Option<String>,

    /// Deadline for a tunneled request in seconds
    #[arg(long, env = "WTS_REQUEST_TIMEOUT", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout: u64,

    /// Bound on the estimated byte size of the in-memory request log
    #[arg(long, env = "WTS_LOG_MAX_SIZE", default_value_t = DEFAULT_LOG_MAX_SIZE)]
    pub log_max_size: usize,

    /// Bound on the number of entries in the in-memory request log
    #[arg(long, env = "WTS_LOG_MAX_ENTRIES", default_value_t = DEFAULT_LOG_MAX_ENTRIES)]
    pub log_max_entries: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Runtime configuration for the tunnel server
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address, e.g. "0.0.0.0:8080"
    pub addr: String,

    /// Folder for recorded bodies
    pub data_dir: PathBuf,

    /// Bearer token required on the agent stream; None disables the check
    pub agent_key: Option<String>,

    /// Deadline for a tunneled request at the ingress
    pub request_timeout: Duration,

    /// Bounds for the in-memory request log
    pub log_max_size: usize,
    pub log_max_entries: usize,
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        Self {
            addr: args.addr,
            data_dir: args.data_dir,
            agent_key: args.agent_key,
            request_timeout: Duration::from_secs(args.request_timeout),
            log_max_size: args.log_max_size,
            log_max_entries: args.log_max_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_args() -> Args {
        Args {
            addr: "127.0.0.1:9000".to_string(),
            data_dir: PathBuf::from("/tmp/data"),
            agent_key: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT_SECS,
            log_max_size: DEFAULT_LOG_MAX_SIZE,
            log_max_entries: DEFAULT_LOG_MAX_ENTRIES,
            verbose: false,
        }
    }

    #[test]
    fn test_config_from_args_defaults() {
        let config = Config::from_args(default_args());

        assert_eq!(config.addr, "127.0.0.1:9000");
        assert_eq!(config.request_timeout, Duration::from_secs(1800));
        assert!(config.agent_key.is_none());
    }

    #[test]
    fn test_config_from_args_with_key() {
        let args = Args {
            agent_key: Some("sekret".to_string()),
            request_timeout: 60,
            ..default_args()
        };

        let config = Config::from_args(args);
        assert_eq!(config.agent_key.as_deref(), Some("sekret"));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
    }
}

use anyhow::{Result, bail};
use clap::Parser;
use std::time::Duration;
use tracing::{error, info, warn};
use webhook_tunnel_common::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS, RECONNECT_MAX_DELAY_MS,
    RECONNECT_MIN_DELAY_MS, RECONNECT_MULTIPLIER,
};
use webhook_tunnel_common::generate_endpoint_name;

mod replay;
mod session;

use session::SessionEnd;

/// CLI arguments for the tunnel agent
#[derive(Parser, Debug)]
#[command(name = "wta")]
#[command(about = "Webhook tunnel agent", long_about = None)]
#[command(version)]
struct Args {
    /// Endpoint name to subscribe to; a random name is generated when omitted
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Local port to replay requests against
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Local host address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// WebSocket tunnel endpoint of the server
    #[arg(
        short,
        long,
        env = "WTA_SERVER",
        default_value = "ws://localhost:8080/tunnel"
    )]
    server: String,

    /// Authentication token presented on the tunnel stream
    #[arg(short, long, env = "WTA_TOKEN")]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct Config {
    /// Local service address, e.g. "http://127.0.0.1:3000"
    pub local_address: String,

    /// WebSocket endpoint URL of the tunnel server
    pub server_url: String,

    /// Endpoint name this agent serves
    pub endpoint: String,

    /// Authentication token
    pub token: Option<String>,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Keepalive ping interval
    pub heartbeat_interval: Duration,

    /// Reconnection strategy
    pub reconnect: ReconnectConfig,
}

/// Reconnection configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Config {
    fn from_args(args: Args) -> Self {
        Self {
            local_address: format!("http://{}:{}", args.host, args.port),
            server_url: args.server,
            endpoint: args.endpoint.unwrap_or_else(generate_endpoint_name),
            token: args.token,
            connect_timeout: Duration::from_secs(args.connect_timeout),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            reconnect: ReconnectConfig {
                min_delay: Duration::from_millis(RECONNECT_MIN_DELAY_MS),
                max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
                multiplier: RECONNECT_MULTIPLIER,
            },
        }
    }
}

/// Run sessions until a fatal error, reconnecting with backoff in between
async fn run(config: Config) -> Result<()> {
    let mut reconnect_delay = config.reconnect.min_delay;
    let mut attempt = 0;

    loop {
        match session::run(&config).await {
            Ok(SessionEnd::Fatal(reason)) => {
                bail!("session rejected by server: {reason}");
            }
            Ok(SessionEnd::Closed) => {
                warn!("connection closed by server");
                reconnect_delay = config.reconnect.min_delay;
                attempt = 0;
            }
            Err(err) => {
                error!("connection failed: {err}");
            }
        }

        attempt += 1;
        info!("reconnecting in {:?} (attempt {})", reconnect_delay, attempt);
        tokio::time::sleep(reconnect_delay).await;

        // Exponential backoff
        reconnect_delay = Duration::from_millis(
            ((reconnect_delay.as_millis() as f64 * config.reconnect.multiplier)
                .min(config.reconnect.max_delay.as_millis() as f64)) as u64,
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Webhook Tunnel Agent v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_args(args);
    info!("Endpoint:      {}", config.endpoint);
    info!("Forwarding to: {}", config.local_address);
    info!("Tunnel server: {}", config.server_url);

    tokio::select! {
        result = run(config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_args() {
        let args = Args {
            endpoint: Some("users".to_string()),
            port: 8080,
            host: "localhost".to_string(),
            server: "wss://tunnel.example.com/tunnel".to_string(),
            token: Some("sekret".to_string()),
            verbose: false,
            connect_timeout: 15,
        };

        let config = Config::from_args(args);
        assert_eq!(config.local_address, "http://localhost:8080");
        assert_eq!(config.endpoint, "users");
        assert_eq!(config.token.as_deref(), Some("sekret"));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_config_generates_endpoint_when_omitted() {
        let args = Args {
            endpoint: None,
            port: 3000,
            host: "127.0.0.1".to_string(),
            server: "ws://localhost:8080/tunnel".to_string(),
            token: None,
            verbose: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
        };

        let config = Config::from_args(args);
        assert_eq!(config.endpoint.len(), 12);
        assert!(config.endpoint.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_reconnect_defaults() {
        let args = Args {
            endpoint: None,
            port: 3000,
            host: "127.0.0.1".to_string(),
            server: "ws://localhost:8080/tunnel".to_string(),
            token: None,
            verbose: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
        };

        let config = Config::from_args(args);
        assert_eq!(
            config.reconnect.min_delay,
            Duration::from_millis(RECONNECT_MIN_DELAY_MS)
        );
        assert_eq!(
            config.reconnect.max_delay,
            Duration::from_millis(RECONNECT_MAX_DELAY_MS)
        );
        assert!(config.reconnect.multiplier > 1.0);
    }
}

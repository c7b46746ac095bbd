use anyhow::Result;
use clap::Parser;
use tracing::info;

use webhook_tunnel_server::{Args, Config, build_state, router};

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

    info!("Webhook Tunnel Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_args(args);
    info!("Data folder: {}", config.data_dir.display());

    let state = build_state(config.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl-C, shutting down gracefully...");
        })
        .await?;

    Ok(())
}

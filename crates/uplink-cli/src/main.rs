//! uplink - tunnel-relay client CLI
//!
//! Asks a tunnel broker for a public endpoint, then relays the assigned
//! number of parallel TCP sessions between that endpoint and a local
//! service.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uplink_broker::BrokerClient;
use uplink_relay::{ProxyDialer, SessionPool};

/// uplink tunnel client - exposes a local TCP service through a public
/// tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "uplink")]
#[command(about = "Expose a local TCP service through a public tunnel endpoint")]
#[command(version)]
#[command(long_about = r#"
uplink asks a tunnel broker for a public endpoint, then relays the assigned
number of parallel TCP sessions between that endpoint and a local service.

EXAMPLES:
  # Expose localhost:8080 under a new random subdomain
  uplink --server https://tunnel.example.com/ --local-port 8080

  # Request a fixed subdomain and traverse a corporate proxy
  HTTP_PROXY=http://proxy.corp:3128 uplink --server https://tunnel.example.com/ \
    --subdomain myapp --local-port 3000

ENVIRONMENT VARIABLES:
  UPLINK_SERVER     Tunnel broker base URL
  UPLINK_SUBDOMAIN  Requested subdomain (empty requests a new one)
  HTTP_PROXY        Optional HTTP forward proxy for remote connections
"#)]
struct Args {
    /// Tunnel broker base URL (e.g. https://tunnel.example.com/)
    #[arg(long, env = "UPLINK_SERVER")]
    server: String,

    /// Requested subdomain; empty asks the broker for a new random one
    #[arg(long, env = "UPLINK_SUBDOMAIN", default_value = "")]
    subdomain: String,

    /// Local host to relay to
    #[arg(long, default_value = "localhost")]
    local_host: String,

    /// Local port to relay to
    #[arg(long)]
    local_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let broker = BrokerClient::new(&args.server).context("Failed to create broker client")?;
    let remote_host = broker.remote_host().to_string();
    let mut pool = SessionPool::new(Arc::new(broker), &remote_host, ProxyDialer::from_env());

    let url = pool
        .bind_assignment(&args.subdomain)
        .await
        .context("Failed to fetch tunnel assignment")?;
    info!("Tunnel now available at: {}", url);

    pool.bind_local_target(&args.local_host, args.local_port)
        .await
        .with_context(|| {
            format!(
                "Local service {}:{} is not reachable",
                args.local_host, args.local_port
            )
        })?;

    let stopper = pool.stop_handle();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut run_task = tokio::spawn(async move { pool.run().await });

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            stopper.stop();
            match run_task.await {
                Ok(Ok(summary)) => {
                    info!(completed = summary.completed, "Tunnel stopped");
                }
                Ok(Err(e)) => {
                    error!("Pool error during shutdown: {:#}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Pool task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
        result = &mut run_task => {
            match result {
                Ok(Ok(summary)) => {
                    info!(completed = summary.completed, "All sessions finished");
                }
                Ok(Err(e)) => {
                    error!("Pool error: {:#}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Pool task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("uplink stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_args_with_defaults() {
        let args = Args::try_parse_from([
            "uplink",
            "--server",
            "https://tunnel.example.com/",
            "--local-port",
            "8080",
        ])
        .unwrap();

        assert_eq!(args.server, "https://tunnel.example.com/");
        assert_eq!(args.subdomain, "");
        assert_eq!(args.local_host, "localhost");
        assert_eq!(args.local_port, 8080);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn local_port_is_required() {
        let result = Args::try_parse_from(["uplink", "--server", "https://tunnel.example.com/"]);
        assert!(result.is_err());
    }
}

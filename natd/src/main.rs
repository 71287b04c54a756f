//! natd daemon: NAT instance bootstrap agent.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipnet::Ipv4Net;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use natd::configurator::{self, NatSpec};
use natd::health::{self, StatusHandle};
use natd::iface;

/// NAT instance bootstrap agent
#[derive(Parser, Debug)]
#[command(name = "natd", version, about)]
struct Args {
    /// Egress network interface for the masquerade rule
    #[arg(long, default_value = "eth0")]
    iface: String,

    /// Use the IPv4 default-route interface instead of --iface
    #[arg(long)]
    detect_iface: bool,

    /// Source subnet to translate (repeatable); all traffic when omitted
    #[arg(long = "source")]
    sources: Vec<Ipv4Net>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Configure NAT once and exit
    Apply,
    /// Configure NAT, then re-verify periodically and serve the health endpoint
    Serve {
        /// Health endpoint listen address
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,

        /// Seconds between kernel state re-checks
        #[arg(long, default_value = "30")]
        check_interval: u64,
    },
    /// Check kernel state without mutating it; exit nonzero when unhealthy
    Verify,
    /// Print the current NAT status as JSON
    Status,
    /// Remove the natd nftables table
    Teardown,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("natd=info")),
        )
        .init();

    let args = Args::parse();

    let iface_name = if args.detect_iface {
        let detected = iface::default_egress().context("egress interface detection failed")?;
        info!(iface = %detected, "detected egress interface");
        detected
    } else {
        args.iface.clone()
    };

    let spec = NatSpec::new(&iface_name, args.sources.clone());

    match args.command {
        Command::Apply => {
            configurator::apply(&spec)?;
            Ok(())
        }
        Command::Serve {
            listen,
            check_interval,
        } => serve(spec, listen, Duration::from_secs(check_interval)).await,
        Command::Verify => {
            let status = configurator::verify(&spec)?;
            if status.healthy {
                info!(iface = %spec.iface, "NAT path healthy");
                Ok(())
            } else {
                anyhow::bail!(
                    "NAT path unhealthy: forwarding={} rules={}/{}",
                    status.forwarding,
                    status.rule_count,
                    status.expected_rules
                );
            }
        }
        Command::Status => {
            let status = configurator::verify(&spec)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Teardown => {
            configurator::teardown()?;
            Ok(())
        }
    }
}

async fn serve(spec: NatSpec, listen: SocketAddr, interval: Duration) -> Result<()> {
    let status = configurator::apply(&spec)?;
    let handle = StatusHandle::new(status);

    tokio::spawn(health::monitor(spec.clone(), handle.clone(), interval));

    let app = health::router(handle);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(addr = %listen, "health endpoint listening");

    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;

    // No teardown on exit: the NAT path must survive agent restarts.
    // Teardown is an explicit subcommand only.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        })
        .await
        .context("health server error")?;

    info!("natd stopped");
    Ok(())
}

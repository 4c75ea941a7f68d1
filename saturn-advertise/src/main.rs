mod advertise;
mod arbiter;

use std::time::Duration;
use clap::Parser;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_PRIORITY, SATURN_SERVICE_TYPE};
use crate::advertise::Advertisement;

/// Announce a local inference backend to Saturn gateways over mDNS
#[derive(Parser, Debug)]
#[command(name = "saturn-advertise")]
struct Args {
    /// Port the backend's HTTP server listens on
    #[arg(long)]
    port: u16,

    /// Preferred priority; lower wins. Bumped if already taken on the network.
    #[arg(long, default_value_t = DEFAULT_PRIORITY)]
    priority: u16,

    /// Instance name; defaults to saturn-<hostname>
    #[arg(long)]
    name: Option<String>,

    /// Value of the `api` TXT property
    #[arg(long, default_value = "openai")]
    api: String,

    /// Address to announce instead of every interface address
    #[arg(long)]
    address: Option<String>,

    #[arg(long, default_value = SATURN_SERVICE_TYPE)]
    service_type: String,

    /// How long to listen for other backends before choosing a priority
    #[arg(long, default_value_t = 2000)]
    settle_ms: u64,

    /// Value of the `version` TXT property
    #[arg(long = "version", default_value = "1.0")]
    service_version: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("saturn_advertise=info"))
        )
        .init();

    let args = Args::parse();

    let instance_name = match args.name {
        Some(name) => name,
        None => format!("saturn-{}", advertise::local_hostname()?),
    };

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;

    let mut ad = Advertisement {
        service_type: args.service_type,
        instance_name,
        port: args.port,
        priority: args.priority,
        version: args.service_version,
        api: args.api,
        address: args.address,
    };

    ad.priority = arbiter::find_available_priority(
        &mdns_daemon,
        &ad.service_type,
        args.priority,
        Duration::from_millis(args.settle_ms),
        &ad.fullname(),
    )
    .await?;

    let service_info = advertise::register_backend(&mdns_daemon, &ad)?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    if let Err(e) = advertise::unregister_backend(&mdns_daemon, &service_info) {
        tracing::error!("Failed to unregister mDNS service: {}", e);
    }

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["saturn-advertise", "--port", "8081"]).unwrap();
        assert_eq!(args.port, 8081);
        assert_eq!(args.priority, 50);
        assert_eq!(args.api, "openai");
        assert_eq!(args.service_type, "_saturn._tcp.local.");
        assert_eq!(args.settle_ms, 2000);
        assert_eq!(args.service_version, "1.0");
        assert!(args.name.is_none());
    }

    #[test]
    fn test_port_is_required() {
        assert!(Args::try_parse_from(["saturn-advertise"]).is_err());
    }
}

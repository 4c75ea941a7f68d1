use std::collections::HashMap;
use std::net::IpAddr;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_PRIORITY, TXT_API, TXT_PRIORITY, TXT_VERSION};
use shared::types::ServiceRecord;

/// What the browser tells the registry. Add and update both arrive as `Resolved`.
#[derive(Debug)]
pub enum DiscoveryEvent {
    Resolved(ServiceRecord),
    Removed(String),
}

type RecvResult = (String, flume::Receiver<ServiceEvent>, std::result::Result<ServiceEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns a clone of the receiver and yields it back with the
/// event, so the loop can re-arm it.
fn make_recv_future(service_type: String, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (service_type, rx, result)
    })
}

pub async fn run_browser(
    daemon: ServiceDaemon,
    service_types: Vec<String>,
    tx: mpsc::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut browsing = FuturesUnordered::new();
    for service_type in &service_types {
        let receiver = daemon
            .browse(service_type)
            .with_context(|| format!("Failed to browse {}", service_type))?;
        tracing::info!("Browsing for {}", service_type);
        browsing.push(make_recv_future(service_type.clone(), receiver));
    }

    loop {
        tokio::select! {
            Some((service_type, rx, result)) = browsing.next() => {
                match result {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        if let Some(record) = convert_service_info(&info) {
                            tracing::debug!("Resolved service: {}", record.name);
                            if let Err(e) = tx.send(DiscoveryEvent::Resolved(record)).await {
                                tracing::error!("Failed to send resolved event: {}", e);
                            }
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                        tracing::debug!("Service removed: {}", fullname);
                        if let Err(e) = tx.send(DiscoveryEvent::Removed(fullname)).await {
                            tracing::error!("Failed to send removed event: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Browse receiver for {} disconnected: {}", service_type, e);
                        continue;
                    }
                }
                browsing.push(make_recv_future(service_type, rx));
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                break;
            }
        }
    }

    for service_type in &service_types {
        if let Err(e) = daemon.stop_browse(service_type) {
            tracing::warn!("Failed to stop browsing {}: {}", service_type, e);
        }
    }

    Ok(())
}

/// Convert an mdns-sd ServiceInfo into a fresh ServiceRecord.
/// Advertisements without a usable address or port are dropped.
pub fn convert_service_info(info: &ServiceInfo) -> Option<ServiceRecord> {
    let port = info.get_port();
    if port == 0 {
        tracing::debug!("Skipping service {} - no port", info.get_fullname());
        return None;
    }

    let Some(address) = pick_address(info.get_addresses().iter()) else {
        tracing::debug!("Skipping service {} - no usable address", info.get_fullname());
        return None;
    };

    let properties: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    let priority = resolve_priority(
        properties.get(TXT_PRIORITY).map(String::as_str),
        info.get_priority(),
    );

    let mut record = ServiceRecord::new(info.get_fullname(), address, port, priority);
    record.service_type = info.get_type().to_string();
    record.version = properties.get(TXT_VERSION).cloned();
    record.api = properties.get(TXT_API).cloned();
    record.properties = properties;
    Some(record)
}

/// Lowest IPv4 address, else lowest routable IPv6 address. Link-local IPv6
/// needs a scope id that a URL cannot carry, so it is never chosen.
fn pick_address<'a>(addresses: impl Iterator<Item = &'a IpAddr>) -> Option<IpAddr> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for addr in addresses {
        match addr {
            IpAddr::V4(ip) => v4.push(*ip),
            IpAddr::V6(ip) if (ip.segments()[0] & 0xffc0) != 0xfe80 => v6.push(*ip),
            IpAddr::V6(_) => {}
        }
    }

    if let Some(ip) = v4.into_iter().min() {
        return Some(IpAddr::V4(ip));
    }
    v6.into_iter().min().map(IpAddr::V6)
}

/// TXT `priority` wins, then a non-zero SRV priority, then the default.
fn resolve_priority(txt: Option<&str>, srv_priority: u16) -> u16 {
    if let Some(priority) = txt.and_then(|v| v.trim().parse::<u16>().ok()) {
        return priority;
    }
    if srv_priority != 0 {
        srv_priority
    } else {
        DEFAULT_PRIORITY
    }
}

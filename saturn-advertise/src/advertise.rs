use std::collections::HashMap;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::{TXT_API, TXT_PRIORITY, TXT_VERSION};

/// What one backend announces about itself
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub service_type: String,
    pub instance_name: String,
    pub port: u16,
    pub priority: u16,
    pub version: String,
    pub api: String,
    /// Fixed address to announce; every interface address when unset
    pub address: Option<String>,
}

impl Advertisement {
    /// Full mDNS instance name, as other peers will see it
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.instance_name, self.service_type)
    }

    fn txt_records(&self) -> HashMap<String, String> {
        HashMap::from([
            (TXT_VERSION.to_string(), self.version.clone()),
            (TXT_API.to_string(), self.api.clone()),
            (TXT_PRIORITY.to_string(), self.priority.to_string()),
        ])
    }
}

pub fn local_hostname() -> Result<String> {
    Ok(hostname::get()
        .context("Failed to get system hostname")?
        .to_string_lossy()
        .to_string())
}

pub fn register_backend(daemon: &ServiceDaemon, ad: &Advertisement) -> Result<ServiceInfo> {
    let host = format!("{}.local.", local_hostname()?);

    // an empty address list is filled from the interfaces once auto is on
    let mut service_info = ServiceInfo::new(
        &ad.service_type,
        &ad.instance_name,
        &host,
        ad.address.as_deref().unwrap_or(""),
        ad.port,
        ad.txt_records(),
    )
    .context("Failed to create ServiceInfo")?;
    if ad.address.is_none() {
        service_info = service_info.enable_addr_auto();
    }

    daemon
        .register(service_info.clone())
        .context("Failed to register mDNS service")?;

    tracing::info!(
        "{} has been registered on port {} with priority {}",
        service_info.get_fullname(),
        ad.port,
        ad.priority
    );

    Ok(service_info)
}

pub fn unregister_backend(daemon: &ServiceDaemon, service_info: &ServiceInfo) -> Result<()> {
    daemon
        .unregister(service_info.get_fullname())
        .context("Failed to unregister mDNS service")?;

    tracing::info!("Unregistered {}", service_info.get_fullname());
    Ok(())
}

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A backend discovered on the network.
/// This is the canonical data model shared by the registry, prober, router and API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Full DNS-SD instance name, e.g. "Ollama._saturn._tcp.local."
    pub name: String,

    /// Service type the advertisement was found under
    pub service_type: String,

    /// Address chosen from the advertisement
    pub address: IpAddr,

    /// Service port
    pub port: u16,

    /// Lower is preferred (DNS SRV semantics)
    pub priority: u16,

    /// TXT `version`, if advertised
    pub version: Option<String>,

    /// TXT `api`, if advertised
    pub api: Option<String>,

    /// All TXT record key-value pairs
    pub properties: HashMap<String, String>,

    /// Most recent discovery or probe event
    pub last_seen: DateTime<Utc>,

    /// Result of the most recent liveness probe
    pub is_healthy: bool,

    /// Models served by the backend. Only meaningful while healthy.
    pub available_models: Vec<String>,

    /// Whether the prober has completed at least one probe of this record
    pub first_probe_complete: bool,
}

impl ServiceRecord {
    /// A freshly discovered record: unhealthy, no models, not yet probed.
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16, priority: u16) -> Self {
        Self {
            name: name.into(),
            service_type: String::new(),
            address,
            port,
            priority,
            version: None,
            api: None,
            properties: HashMap::new(),
            last_seen: Utc::now(),
            is_healthy: false,
            available_models: Vec::new(),
            first_probe_complete: false,
        }
    }

    /// Base URL of the backend, e.g. "http://192.168.1.20:8080"
    pub fn base_url(&self) -> String {
        format!("http://{}", SocketAddr::new(self.address, self.port))
    }

    /// Whether the record may be routed to for `model`
    pub fn serves(&self, model: &str) -> bool {
        self.is_healthy && self.available_models.iter().any(|m| m == model)
    }
}

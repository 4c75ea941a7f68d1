// Priority arbiter
//
// Before registering, listen to the network for a short while and collect
// the priorities other backends already claim, then take the first free one
// at or above the desired value. Two backends starting at the same moment
// can still pick the same value; this is best-effort only.

use std::collections::HashSet;
use std::time::Duration;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use anyhow::{Context, Result};
use shared::protocol::TXT_PRIORITY;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArbiterError {
    #[error("no free priority at or above {0}")]
    Exhausted(u16),
}

/// Browse `service_type` for `settle` and pick a priority nobody else holds.
/// `own_fullname` is ignored so a restart does not collide with its own
/// lingering advertisement.
pub async fn find_available_priority(
    daemon: &ServiceDaemon,
    service_type: &str,
    desired: u16,
    settle: Duration,
    own_fullname: &str,
) -> Result<u16> {
    let receiver = daemon
        .browse(service_type)
        .with_context(|| format!("Failed to browse {}", service_type))?;

    let taken = collect_priorities(&receiver, settle, own_fullname).await;

    if let Err(e) = daemon.stop_browse(service_type) {
        tracing::debug!("Failed to stop browsing {}: {}", service_type, e);
    }

    let chosen = next_free_priority(desired, &taken)?;
    if chosen != desired {
        tracing::info!("Priority {} is in use, adjusted to {}", desired, chosen);
    }
    Ok(chosen)
}

async fn collect_priorities(
    receiver: &flume::Receiver<ServiceEvent>,
    settle: Duration,
    own_fullname: &str,
) -> HashSet<u16> {
    let deadline = tokio::time::Instant::now() + settle;
    let mut taken = HashSet::new();

    loop {
        let event = match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) | Err(_) => break,
        };

        if let ServiceEvent::ServiceResolved(info) = event {
            if info.get_fullname() == own_fullname {
                continue;
            }
            let priority = info
                .get_properties()
                .get_property_val_str(TXT_PRIORITY)
                .and_then(|value| value.trim().parse::<u16>().ok());
            match priority {
                Some(priority) => {
                    tracing::debug!("{} holds priority {}", info.get_fullname(), priority);
                    taken.insert(priority);
                }
                None => tracing::debug!("{} has no usable priority", info.get_fullname()),
            }
        }
    }

    taken
}

/// First priority at or above `desired` that is not in `taken`
pub fn next_free_priority(desired: u16, taken: &HashSet<u16>) -> Result<u16, ArbiterError> {
    (desired..=u16::MAX)
        .find(|p| !taken.contains(p))
        .ok_or(ArbiterError::Exhausted(desired))
}

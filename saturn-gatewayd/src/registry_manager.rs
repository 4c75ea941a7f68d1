use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::types::ServiceRecord;
use crate::registry::{fingerprint, HealthTransition, ProbeResult, ServiceStore, UpsertOutcome};
pub use crate::mdns::browser::DiscoveryEvent;

/// Commands sent to the registry task
pub enum RegistryCommand {
    Upsert(ServiceRecord, oneshot::Sender<UpsertOutcome>),
    Remove(String, oneshot::Sender<bool>),
    RecordProbe(String, ProbeResult, oneshot::Sender<Option<HealthTransition>>),
    Snapshot(oneshot::Sender<Vec<ServiceRecord>>),
    Get(String, oneshot::Sender<Option<ServiceRecord>>),
    Shutdown,
}

/// Handle to the service registry.
///
/// The registry task owns the record map outright; every read and write is a
/// message to it, so no caller ever holds registry state across network I/O.
/// Once the task has stopped, reads come back empty and writes are dropped.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
    fingerprint_rx: watch::Receiver<String>,
    seen_rx: watch::Receiver<bool>,
    new_service: Arc<Notify>,
}

impl RegistryHandle {
    /// Spawn the registry task with an empty store
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<RegistryCommand>(256);
        let mut store = ServiceStore::new();

        let (fingerprint_tx, fingerprint_rx) =
            watch::channel(fingerprint::compute_fingerprint(&[]));
        let (seen_tx, seen_rx) = watch::channel(false);
        let new_service = Arc::new(Notify::new());
        let notify = new_service.clone();

        let publish_fingerprint = move |store: &ServiceStore| {
            let next = fingerprint::compute_fingerprint(&store.snapshot());
            fingerprint_tx.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            });
        };

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    RegistryCommand::Upsert(record, reply) => {
                        let outcome = store.upsert(record);
                        if outcome == UpsertOutcome::Inserted {
                            seen_tx.send_replace(true);
                            notify.notify_one();
                        }
                        if outcome != UpsertOutcome::Unchanged {
                            publish_fingerprint(&store);
                        }
                        let _ = reply.send(outcome);
                    }
                    RegistryCommand::Remove(name, reply) => {
                        let removed = store.remove(&name);
                        if removed {
                            publish_fingerprint(&store);
                        }
                        let _ = reply.send(removed);
                    }
                    RegistryCommand::RecordProbe(name, result, reply) => {
                        let transition = match store.apply_probe(&name, result) {
                            Some(transition) => {
                                publish_fingerprint(&store);
                                transition
                            }
                            None => {
                                tracing::debug!("Dropping probe result for removed service {}", name);
                                None
                            }
                        };
                        let _ = reply.send(transition);
                    }
                    RegistryCommand::Snapshot(reply) => {
                        let _ = reply.send(store.snapshot());
                    }
                    RegistryCommand::Get(name, reply) => {
                        let _ = reply.send(store.get(&name));
                    }
                    RegistryCommand::Shutdown => {
                        tracing::info!("Registry shutting down with {} services", store.len());
                        break;
                    }
                }
            }
        });

        Self {
            tx,
            fingerprint_rx,
            seen_rx,
            new_service,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(make(reply)).await.is_err() {
            tracing::warn!("Registry is not running");
            return None;
        }
        rx.await.ok()
    }

    /// Insert a record, or refresh the location fields of a known one
    pub async fn upsert(&self, record: ServiceRecord) -> UpsertOutcome {
        self.request(|reply| RegistryCommand::Upsert(record, reply))
            .await
            .unwrap_or(UpsertOutcome::Unchanged)
    }

    /// Remove a service. Returns true if it was known.
    pub async fn remove(&self, name: impl Into<String>) -> bool {
        let name = name.into();
        self.request(|reply| RegistryCommand::Remove(name, reply))
            .await
            .unwrap_or(false)
    }

    /// Write back a probe result. Returns the health transition to report, if any.
    pub async fn record_probe(&self, name: impl Into<String>, result: ProbeResult) -> Option<HealthTransition> {
        let name = name.into();
        self.request(|reply| RegistryCommand::RecordProbe(name, result, reply))
            .await
            .flatten()
    }

    /// Copy of every record, ordered by name
    pub async fn snapshot(&self) -> Vec<ServiceRecord> {
        self.request(RegistryCommand::Snapshot).await.unwrap_or_default()
    }

    pub async fn get(&self, name: impl Into<String>) -> Option<ServiceRecord> {
        let name = name.into();
        self.request(|reply| RegistryCommand::Get(name, reply))
            .await
            .flatten()
    }

    /// Current registry fingerprint
    pub fn fingerprint(&self) -> String {
        self.fingerprint_rx.borrow().clone()
    }

    /// Fires when a service not previously known is inserted
    pub fn new_service_notify(&self) -> Arc<Notify> {
        self.new_service.clone()
    }

    /// Wait until at least one service has been discovered.
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_first_service(&self, timeout: Duration) -> bool {
        let mut seen = self.seen_rx.clone();
        // bound to a local so the borrowed watch::Ref drops before `seen`
        let seen_any = matches!(
            tokio::time::timeout(timeout, seen.wait_for(|seen| *seen)).await,
            Ok(Ok(_))
        );
        seen_any
    }

    /// Stop the registry task
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(RegistryCommand::Shutdown).await?;
        Ok(())
    }
}

/// Discovery bridge: applies browser events to the registry
pub async fn run(
    registry: RegistryHandle,
    mut rx: mpsc::Receiver<DiscoveryEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                match event {
                    DiscoveryEvent::Resolved(record) => {
                        let name = record.name.clone();
                        let location = format!("{}:{}", record.address, record.port);
                        let priority = record.priority;
                        match registry.upsert(record).await {
                            UpsertOutcome::Inserted => tracing::info!(
                                "Discovered service: {} at {} (priority: {})",
                                name, location, priority
                            ),
                            UpsertOutcome::Updated => tracing::info!(
                                "Updated service: {} at {} (priority: {})",
                                name, location, priority
                            ),
                            UpsertOutcome::Unchanged => {}
                        }
                    }
                    DiscoveryEvent::Removed(name) => {
                        if registry.remove(name.as_str()).await {
                            tracing::info!("Removed service: {}", name);
                        }
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Discovery bridge shutting down");
                break;
            }
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use shared::openai::BackendModelList;
use shared::protocol::{HEALTH_PATH, MODELS_PATH};
use shared::types::ServiceRecord;
use crate::config::HealthConfig;
use crate::registry::{HealthTransition, ProbeResult};
use crate::registry_manager::RegistryHandle;

/// Periodically probes every registered backend for liveness and models.
///
/// Probing never happens on the request path. A backend that dies between
/// cycles is caught by the router's own failover.
pub struct HealthProber {
    registry: RegistryHandle,
    client: Client,
    config: HealthConfig,
}

impl HealthProber {
    pub fn new(registry: RegistryHandle, config: HealthConfig) -> Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .build()
            .context("Failed to create probe HTTP client")?;

        Ok(Self {
            registry,
            client,
            config,
        })
    }

    /// Starts the prober task.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    /// Probe loop. A cycle runs on every interval tick and whenever a new
    /// service appears, so newcomers do not wait a full interval.
    async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let new_service = self.registry.new_service_notify();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = new_service.notified() => {}
                _ = cancel.cancelled() => break,
            }

            tokio::select! {
                _ = self.probe_all() => {}
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!("Health prober shutting down");
    }

    /// Probe every registered service concurrently and write back results
    pub async fn probe_all(&self) {
        let services = self.registry.snapshot().await;

        let probes = services.into_iter().map(|service| async move {
            let result = self.probe(&service).await;
            (service, result)
        });
        let results = futures::future::join_all(probes).await;

        for (service, result) in results {
            let healthy = result.healthy;
            match self.registry.record_probe(service.name.as_str(), result).await {
                Some(HealthTransition::BecameHealthy) => {
                    tracing::info!("{} is now healthy", service.name);
                }
                Some(HealthTransition::BecameUnhealthy) => {
                    tracing::warn!("{} is now unhealthy", service.name);
                }
                None => {
                    tracing::debug!("Probed {}: healthy={}", service.name, healthy);
                }
            }
        }
    }

    /// Liveness and model list are fetched independently
    async fn probe(&self, service: &ServiceRecord) -> ProbeResult {
        let base_url = service.base_url();
        let (healthy, models) = tokio::join!(
            self.check_health(&base_url),
            self.fetch_models(&base_url),
        );

        ProbeResult {
            healthy,
            models,
            checked_at: Utc::now(),
        }
    }

    async fn check_health(&self, base_url: &str) -> bool {
        let result = self
            .client
            .get(format!("{}{}", base_url, HEALTH_PATH))
            .timeout(self.config.health_timeout())
            .send()
            .await;

        match result {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                tracing::debug!("Health check against {} failed: {}", base_url, e);
                false
            }
        }
    }

    async fn fetch_models(&self, base_url: &str) -> Option<Vec<String>> {
        let response = self
            .client
            .get(format!("{}{}", base_url, MODELS_PATH))
            .timeout(self.config.models_timeout())
            .send()
            .await
            .map_err(|e| tracing::debug!("Failed to fetch models from {}: {}", base_url, e))
            .ok()?;

        if !response.status().is_success() {
            tracing::debug!("Model list from {} returned {}", base_url, response.status());
            return None;
        }

        let list: BackendModelList = response
            .json()
            .await
            .map_err(|e| tracing::debug!("Invalid model list from {}: {}", base_url, e))
            .ok()?;

        Some(list.models.into_iter().map(|m| m.id).collect())
    }
}

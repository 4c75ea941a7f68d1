// Model router
//
// Picks the healthy backends advertising a model, tries them in priority
// order, and fails over to the next one when an attempt fails before any
// response has reached the caller.

mod relay;

pub use relay::SseRelay;

use std::time::Duration;
use anyhow::Context;
use reqwest::Client;
use serde_json::Value;
use shared::openai::{ChatCompletionRequest, ModelEntry, ModelsResponse};
use shared::protocol::CHAT_COMPLETIONS_PATH;
use shared::types::ServiceRecord;
use crate::config::RouterConfig;
use crate::registry_manager::RegistryHandle;

/// Longest backend error body quoted back in diagnostics
const ERROR_BODY_LIMIT: usize = 200;

/// Upper bound on reading an error body, which is only used for diagnostics
const ERROR_BODY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No healthy backend advertises the model
    #[error("Model '{0}' not found in any available service")]
    ModelNotFound(String),
    /// Every attempted candidate failed
    #[error("All services failed for model '{model}'. Last error: {last_error}")]
    AllFailed { model: String, last_error: String },
    /// The outbound request could not be constructed
    #[error("Failed to build request for {service}: {message}")]
    Internal { service: String, message: String },
}

/// Why a single candidate was skipped
#[derive(Debug, thiserror::Error)]
pub enum CandidateFailure {
    #[error("Service {service} timed out")]
    Timeout { service: String },
    #[error("Service {service} returned HTTP {status}: {body}")]
    Status { service: String, status: u16, body: String },
    #[error("Service {service} returned invalid format: {reason}")]
    InvalidBody { service: String, reason: String },
    #[error("Service {service} failed: {reason}")]
    Transport { service: String, reason: String },
}

/// A successful routing result
pub enum RouteResponse {
    Json(Value),
    Stream(SseRelay),
}

enum Attempt {
    Delivered(RouteResponse),
    Failed(CandidateFailure),
}

#[derive(Clone)]
pub struct ModelRouter {
    registry: RegistryHandle,
    client: Client,
    request_timeout: Duration,
}

impl ModelRouter {
    pub fn new(registry: RegistryHandle, config: &RouterConfig) -> anyhow::Result<Self> {
        Self::with_timeouts(registry, config.request_timeout(), config.connect_timeout())
    }

    pub fn with_timeouts(
        registry: RegistryHandle,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .no_proxy()
            .build()
            .context("Failed to create routing HTTP client")?;

        Ok(Self {
            registry,
            client,
            request_timeout,
        })
    }

    /// Healthy services advertising `model_id`, most preferred first
    pub async fn candidates(&self, model_id: &str) -> Vec<ServiceRecord> {
        select_candidates(self.registry.snapshot().await, model_id)
    }

    /// Every model served by a healthy backend, each listed once
    pub async fn models(&self) -> ModelsResponse {
        aggregate_models(self.registry.snapshot().await)
    }

    /// Forward `request` to the best candidate for `model_id`, trying up to
    /// `max_retries` distinct candidates. The candidate list is fixed when the
    /// call starts; registry changes during the call do not reorder it.
    pub async fn route(
        &self,
        model_id: &str,
        request: &ChatCompletionRequest,
        max_retries: usize,
    ) -> Result<RouteResponse, RouteError> {
        let candidates = self.candidates(model_id).await;
        if candidates.is_empty() {
            return Err(RouteError::ModelNotFound(model_id.to_string()));
        }

        let mut last_error = String::new();
        for service in candidates.iter().take(max_retries.max(1)) {
            tracing::info!(
                "Routing '{}' request to {} at {}",
                model_id,
                service.name,
                service.base_url()
            );

            match self.attempt(service, request).await? {
                Attempt::Delivered(response) => {
                    tracing::info!("Successfully routed to {}", service.name);
                    return Ok(response);
                }
                Attempt::Failed(failure) => {
                    tracing::warn!("{}", failure);
                    last_error = failure.to_string();
                }
            }
        }

        Err(RouteError::AllFailed {
            model: model_id.to_string(),
            last_error,
        })
    }

    async fn attempt(
        &self,
        service: &ServiceRecord,
        request: &ChatCompletionRequest,
    ) -> Result<Attempt, RouteError> {
        let url = format!("{}{}", service.base_url(), CHAT_COMPLETIONS_PATH);
        let builder = self.client.post(&url).json(request);

        if request.stream {
            // The total timeout would cut off long generations, so it only
            // bounds the wait for headers; the relay applies it per chunk.
            let response = match tokio::time::timeout(self.request_timeout, builder.send()).await {
                Err(_) => {
                    return Ok(Attempt::Failed(CandidateFailure::Timeout {
                        service: service.name.clone(),
                    }))
                }
                Ok(Err(e)) => return classify_send_error(service, e),
                Ok(Ok(response)) => response,
            };
            let response = match check_status(service, response, self.error_body_timeout()).await {
                Ok(response) => response,
                Err(failure) => return Ok(Attempt::Failed(failure)),
            };

            tracing::info!("Returning streaming response from {}", service.name);
            let mut relay = SseRelay::new(
                service.name.clone(),
                response.bytes_stream(),
                self.request_timeout,
            );
            return Ok(match relay.prime().await {
                Ok(()) => Attempt::Delivered(RouteResponse::Stream(relay)),
                Err(reason) => Attempt::Failed(CandidateFailure::InvalidBody {
                    service: service.name.clone(),
                    reason,
                }),
            });
        }

        let response = match builder.timeout(self.request_timeout).send().await {
            Ok(response) => response,
            Err(e) => return classify_send_error(service, e),
        };
        let response = match check_status(service, response, self.error_body_timeout()).await {
            Ok(response) => response,
            Err(failure) => return Ok(Attempt::Failed(failure)),
        };

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => {
                return Ok(Attempt::Failed(CandidateFailure::Timeout {
                    service: service.name.clone(),
                }))
            }
            Err(e) => {
                return Ok(Attempt::Failed(CandidateFailure::InvalidBody {
                    service: service.name.clone(),
                    reason: format!("Service returned invalid JSON: {}", e),
                }))
            }
        };

        if !has_choices(&body) {
            return Ok(Attempt::Failed(CandidateFailure::InvalidBody {
                service: service.name.clone(),
                reason: "missing 'choices' field".to_string(),
            }));
        }

        Ok(Attempt::Delivered(RouteResponse::Json(body)))
    }

    fn error_body_timeout(&self) -> Duration {
        self.request_timeout.min(ERROR_BODY_TIMEOUT)
    }
}

fn classify_send_error(service: &ServiceRecord, e: reqwest::Error) -> Result<Attempt, RouteError> {
    if e.is_builder() {
        return Err(RouteError::Internal {
            service: service.name.clone(),
            message: e.to_string(),
        });
    }
    let failure = if e.is_timeout() {
        CandidateFailure::Timeout {
            service: service.name.clone(),
        }
    } else {
        CandidateFailure::Transport {
            service: service.name.clone(),
            reason: e.to_string(),
        }
    };
    Ok(Attempt::Failed(failure))
}

/// Pass 2xx responses through. Anything else becomes a `Status` failure
/// quoting whatever of the body arrives within `body_timeout`.
async fn check_status(
    service: &ServiceRecord,
    response: reqwest::Response,
    body_timeout: Duration,
) -> Result<reqwest::Response, CandidateFailure> {
    let status = response.status();
    tracing::info!("Response status from {}: {}", service.name, status);
    if status.is_success() {
        return Ok(response);
    }

    let mut body = match tokio::time::timeout(body_timeout, response.text()).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            tracing::debug!("Failed to read error body from {}: {}", service.name, e);
            String::new()
        }
        Err(_) => {
            tracing::debug!("Error body from {} did not complete in time", service.name);
            String::new()
        }
    };
    if let Some((cut, _)) = body.char_indices().nth(ERROR_BODY_LIMIT) {
        body.truncate(cut);
    }
    Err(CandidateFailure::Status {
        service: service.name.clone(),
        status: status.as_u16(),
        body,
    })
}

/// A non-streaming completion must carry a `choices` array. An empty array
/// is passed through as the backend's answer.
fn has_choices(body: &Value) -> bool {
    body.get("choices").is_some_and(Value::is_array)
}

/// Healthy services serving `model_id`, ordered by priority then name
pub fn select_candidates(services: Vec<ServiceRecord>, model_id: &str) -> Vec<ServiceRecord> {
    let mut candidates: Vec<ServiceRecord> = services
        .into_iter()
        .filter(|s| s.serves(model_id))
        .collect();
    candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
    candidates
}

/// Union of models across healthy services. `owned_by` names the preferred
/// backend; `services` lists every backend serving the model.
pub fn aggregate_models(services: Vec<ServiceRecord>) -> ModelsResponse {
    let mut healthy: Vec<ServiceRecord> = services.into_iter().filter(|s| s.is_healthy).collect();
    healthy.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

    let mut models: Vec<ModelEntry> = Vec::new();
    for service in &healthy {
        for model_id in &service.available_models {
            match models.iter_mut().find(|m| &m.id == model_id) {
                Some(entry) => entry.services.push(service.name.clone()),
                None => models.push(ModelEntry {
                    id: model_id.clone(),
                    object: "model".to_string(),
                    owned_by: service.name.clone(),
                    services: vec![service.name.clone()],
                }),
            }
        }
    }

    ModelsResponse { models }
}

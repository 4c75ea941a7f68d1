// OpenAI-compatible wire types
//
// The subset of the Chat Completions API spoken between callers, the
// gateway, and backends.

use serde::{Deserialize, Serialize};

/// Request body for /v1/chat/completions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model identifier as advertised by a backend's /v1/models
    pub model: String,
    /// Messages in the conversation
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Whether to stream the response as SSE frames
    #[serde(default)]
    pub stream: bool,
}

/// Chat message in OpenAI format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Model list returned by backends from /v1/models
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendModelList {
    #[serde(default)]
    pub models: Vec<BackendModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendModel {
    pub id: String,
}

/// Response body for the gateway's /v1/models
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelEntry>,
}

/// One model in the gateway's aggregated model list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    /// Always "model"
    pub object: String,
    /// Preferred (lowest priority) backend serving this model
    pub owned_by: String,
    /// Every healthy backend serving this model, in priority order
    pub services: Vec<String>,
}

/// Response body for the gateway's /v1/health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "ok" when at least one service is healthy, otherwise "no_services"
    pub status: String,
    pub provider: String,
    /// Number of healthy services
    pub services: usize,
    /// Number of known services, healthy or not
    pub total_services: usize,
}

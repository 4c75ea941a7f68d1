//! Helpers for tests that need real backends on loopback.

use std::net::SocketAddr;
use axum::Router;
use serde_json::{json, Value};
use shared::openai::{ChatCompletionRequest, ChatMessage, Role};
use shared::types::ServiceRecord;

/// Serve `app` on an ephemeral loopback port
pub async fn spawn_backend(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing is listening on
pub fn closed_port_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// A probed, healthy record pointing at `addr`
pub fn backend_record(name: &str, addr: SocketAddr, priority: u16, models: &[&str]) -> ServiceRecord {
    let mut record = ServiceRecord::new(name, addr.ip(), addr.port(), priority);
    record.service_type = "_saturn._tcp.local.".to_string();
    record.is_healthy = true;
    record.first_probe_complete = true;
    record.available_models = models.iter().map(|m| m.to_string()).collect();
    record
}

pub fn chat_request(model: &str, stream: bool) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![ChatMessage {
            role: Role::User,
            content: "hello".to_string(),
        }],
        max_tokens: None,
        stream,
    }
}

/// Minimal non-streaming completion as a backend would return it
pub fn completion_body(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

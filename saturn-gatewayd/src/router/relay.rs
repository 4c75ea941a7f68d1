use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use axum::body::Bytes;
use futures::stream::{Stream, StreamExt};
use serde::de::IgnoredAny;
use shared::protocol::SSE_DONE;

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// A line longer than this is dropped as malformed
const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("stream from {service} stalled for {secs}s")]
    Stalled { service: String, secs: u64 },
    #[error("stream from {service} failed: {source}")]
    Upstream {
        service: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Forward-only relay of a backend's streaming chat completion.
///
/// The backend body is re-framed line by line into `data: <json>\n\n`
/// frames. Nothing is buffered beyond the current partial line.
/// `[DONE]` is emitted exactly once. The relay owns the upstream response,
/// so dropping it (the caller went away) closes the backend connection.
pub struct SseRelay {
    service: String,
    upstream: Option<ByteStream>,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a newline
    scanned: usize,
    /// Skipping the rest of an oversized line
    discarding: bool,
    pending: VecDeque<Bytes>,
    idle_timeout: Duration,
    terminated: bool,
    upstream_done: bool,
    frames: usize,
}

impl SseRelay {
    pub fn new<S>(service: impl Into<String>, upstream: S, idle_timeout: Duration) -> Self
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    {
        Self {
            service: service.into(),
            upstream: Some(Box::pin(upstream)),
            buffer: Vec::new(),
            scanned: 0,
            discarding: false,
            pending: VecDeque::new(),
            idle_timeout,
            terminated: false,
            upstream_done: false,
            frames: 0,
        }
    }

    /// Name of the backend this relay reads from
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Read ahead until the first frame is available.
    ///
    /// Until this succeeds nothing has reached the caller, so the router may
    /// still fail over. A backend that closes or errors before producing a
    /// frame is reported as a failure.
    pub async fn prime(&mut self) -> Result<(), String> {
        match self.next_frame().await {
            Some(Ok(frame)) => {
                if self.frames == 0 && !self.upstream_done {
                    return Err("stream ended before any data".to_string());
                }
                self.pending.push_front(frame);
                Ok(())
            }
            Some(Err(e)) => Err(e.to_string()),
            None => Err("stream ended before any data".to_string()),
        }
    }

    /// Next SSE frame, or `None` once the stream has terminated
    pub async fn next_frame(&mut self) -> Option<Result<Bytes, RelayError>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }
            if self.terminated {
                return None;
            }

            let Some(upstream) = self.upstream.as_mut() else {
                // backend closed without [DONE]
                self.push_done();
                continue;
            };

            match tokio::time::timeout(self.idle_timeout, upstream.next()).await {
                Err(_) => {
                    self.close();
                    return Some(Err(RelayError::Stalled {
                        service: self.service.clone(),
                        secs: self.idle_timeout.as_secs(),
                    }));
                }
                Ok(Some(Err(source))) => {
                    self.close();
                    return Some(Err(RelayError::Upstream {
                        service: self.service.clone(),
                        source,
                    }));
                }
                Ok(Some(Ok(chunk))) => {
                    self.buffer.extend_from_slice(&chunk);
                    self.drain_lines();
                }
                Ok(None) => {
                    self.upstream = None;
                    let rest = std::mem::take(&mut self.buffer);
                    self.scanned = 0;
                    if !self.discarding {
                        self.accept_line(&rest);
                    }
                }
            }
        }
    }

    /// The relay as a byte stream suitable for a response body
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, RelayError>> + Send {
        futures::stream::unfold(self, |mut relay| async move {
            relay.next_frame().await.map(|item| (item, relay))
        })
    }

    fn drain_lines(&mut self) {
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scanned = 0;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            self.accept_line(&line);
            if self.terminated {
                self.buffer.clear();
                return;
            }
        }

        self.scanned = self.buffer.len();
        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::debug!("Dropping oversized line from {}", self.service);
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
        }
    }

    fn accept_line(&mut self, raw: &[u8]) {
        if self.terminated {
            return;
        }
        let Ok(text) = std::str::from_utf8(raw) else {
            tracing::debug!("Skipping non UTF-8 chunk from {}", self.service);
            return;
        };
        let line = text.trim();
        if line.is_empty() {
            return;
        }

        let payload = if let Some(rest) = line.strip_prefix("data:") {
            rest.trim_start()
        } else if line.starts_with(':')
            || line.starts_with("event:")
            || line.starts_with("id:")
            || line.starts_with("retry:")
        {
            return;
        } else {
            // NDJSON backends send bare JSON lines
            line
        };

        if payload == SSE_DONE {
            self.upstream_done = true;
            self.push_done();
            return;
        }

        if serde_json::from_str::<IgnoredAny>(payload).is_err() {
            tracing::debug!("Skipping malformed chunk from {}: {:.200}", self.service, payload);
            return;
        }

        self.frames += 1;
        self.pending.push_back(Bytes::from(format!("data: {}\n\n", payload)));
    }

    fn push_done(&mut self) {
        self.pending.push_back(Bytes::from(format!("data: {}\n\n", SSE_DONE)));
        self.close();
    }

    /// Stop reading and drop the upstream connection
    fn close(&mut self) {
        self.terminated = true;
        self.upstream = None;
    }
}

impl Drop for SseRelay {
    fn drop(&mut self) {
        if self.terminated {
            tracing::debug!("Stream from {} complete after {} chunks", self.service, self.frames);
        } else {
            tracing::debug!(
                "Stream from {} dropped by caller after {} chunks",
                self.service,
                self.frames
            );
        }
    }
}

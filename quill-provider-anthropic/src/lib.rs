//! Anthropic Provider
//!
//! Implements `Provider` for the Anthropic Messages API: request
//! formatting (top-level system string, typed content blocks), SSE
//! stream parsing into the tagged event stream, and the model catalog.

mod sse;
mod wire;

pub use sse::SseParser;
pub use wire::{build_request_body, parse_messages};

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use quill_core::provider::{ChatRequest, ModelInfo, Provider, ProviderSettings};
use quill_core::retry::retryable_status;
use quill_core::stream::{self, EventStream, StreamEvent};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    extra_headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            api_key: settings.api_key.clone().unwrap_or_default(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            extra_headers: settings
                .extra_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![
            ModelInfo {
                id: "claude-opus-4-20250514".into(),
                display_name: "Claude Opus 4".into(),
                provider: "anthropic".into(),
                context_window: 200_000,
                max_output_tokens: 32_000,
                supports_tools: true,
                supports_vision: true,
            },
            ModelInfo {
                id: "claude-sonnet-4-20250514".into(),
                display_name: "Claude Sonnet 4".into(),
                provider: "anthropic".into(),
                context_window: 200_000,
                max_output_tokens: 64_000,
                supports_tools: true,
                supports_vision: true,
            },
            ModelInfo {
                id: "claude-3-5-haiku-20241022".into(),
                display_name: "Claude 3.5 Haiku".into(),
                provider: "anthropic".into(),
                context_window: 200_000,
                max_output_tokens: 8_192,
                supports_tools: true,
                supports_vision: true,
            },
        ]
    }

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = build_request_body(request);
        let url = format!("{}/v1/messages", self.base_url);

        info!(model = %request.model, url = %url, "opening Anthropic stream");

        let mut http = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json");
        for (key, value) in &self.extra_headers {
            http = http.header(key, value);
        }

        let (tx, rx) = stream::channel();

        let response = match http.json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                // Network-level failure: surface as a retryable stream error.
                send_error(tx, format!("request failed: {e}"), true).await;
                return Ok(rx);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let retryable = retryable_status(status.as_u16());
            let detail = response.text().await.unwrap_or_default();
            send_error(
                tx,
                format!("Anthropic API error (HTTP {}): {}", status.as_u16(), detail),
                retryable,
            )
            .await;
            return Ok(rx);
        }

        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut byte_stream = response.bytes_stream();
            let mut line_buffer = String::new();

            'read: while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(StreamEvent::StreamError {
                                message: format!("stream read error: {e}"),
                                retryable: true,
                            })
                            .await;
                        return;
                    }
                };
                line_buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = line_buffer.find('\n') {
                    let line = line_buffer[..pos].trim_end_matches('\r').to_string();
                    line_buffer = line_buffer[pos + 1..].to_string();

                    for event in parser.feed(&line) {
                        let terminal = matches!(
                            event,
                            StreamEvent::FinishStep { .. } | StreamEvent::StreamError { .. }
                        );
                        if tx.send(event).await.is_err() {
                            // Receiver dropped: the session cancelled;
                            // dropping the response closes the connection.
                            return;
                        }
                        if terminal {
                            break 'read;
                        }
                    }
                }
            }

            if !parser.is_finished() {
                debug!("Anthropic stream ended without message_stop");
                let _ = tx
                    .send(StreamEvent::StreamError {
                        message: "stream ended before completion".into(),
                        retryable: true,
                    })
                    .await;
            }
        });

        Ok(rx)
    }
}

async fn send_error(tx: mpsc::Sender<StreamEvent>, message: String, retryable: bool) {
    let _ = tx
        .send(StreamEvent::StreamError { message, retryable })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::provider::Provider as _;

    #[test]
    fn catalog_has_sonnet() {
        let provider = AnthropicProvider::new(&ProviderSettings::default());
        assert!(provider.models().iter().any(|m| m.id.contains("sonnet")));
        assert!(provider.get_model("claude-sonnet-4-20250514").is_some());
        assert!(provider.get_model("nonexistent").is_none());
    }
}

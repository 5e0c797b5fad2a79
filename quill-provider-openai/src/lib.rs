//! OpenAI Provider
//!
//! Implements `Provider` for the OpenAI Chat Completions API and
//! compatible endpoints: request formatting (system as the first
//! message, function-style tool calls), SSE delta parsing, and the
//! model catalog.

mod sse;
mod wire;

pub use sse::SseParser;
pub use wire::{build_request_body, parse_messages};

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use quill_core::provider::{ChatRequest, ModelInfo, Provider, ProviderSettings};
use quill_core::retry::retryable_status;
use quill_core::stream::{self, EventStream, StreamEvent};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    extra_headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl OpenAiProvider {
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
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![
            ModelInfo {
                id: "gpt-4o".into(),
                display_name: "GPT-4o".into(),
                provider: "openai".into(),
                context_window: 128_000,
                max_output_tokens: 16_384,
                supports_tools: true,
                supports_vision: true,
            },
            ModelInfo {
                id: "gpt-4o-mini".into(),
                display_name: "GPT-4o mini".into(),
                provider: "openai".into(),
                context_window: 128_000,
                max_output_tokens: 16_384,
                supports_tools: true,
                supports_vision: true,
            },
            ModelInfo {
                id: "gpt-4.1".into(),
                display_name: "GPT-4.1".into(),
                provider: "openai".into(),
                context_window: 1_000_000,
                max_output_tokens: 32_768,
                supports_tools: true,
                supports_vision: true,
            },
        ]
    }

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = build_request_body(request);
        let url = format!("{}/v1/chat/completions", self.base_url);

        info!(model = %request.model, url = %url, "opening OpenAI stream");

        let mut http = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json");
        for (key, value) in &self.extra_headers {
            http = http.header(key, value);
        }

        let (tx, rx) = stream::channel();

        let response = match http.json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::StreamError {
                        message: format!("request failed: {e}"),
                        retryable: true,
                    })
                    .await;
                return Ok(rx);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let retryable = retryable_status(status.as_u16());
            let detail = response.text().await.unwrap_or_default();
            let _ = tx
                .send(StreamEvent::StreamError {
                    message: format!("OpenAI API error (HTTP {}): {}", status.as_u16(), detail),
                    retryable,
                })
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
                            return;
                        }
                        if terminal {
                            break 'read;
                        }
                    }
                }
            }

            if !parser.is_finished() {
                // Some compatible endpoints close the connection right
                // after the finish_reason chunk without sending [DONE].
                match parser.finalize() {
                    Some(event) => {
                        let _ = tx.send(event).await;
                    }
                    None => {
                        debug!("OpenAI stream ended without finish_reason");
                        let _ = tx
                            .send(StreamEvent::StreamError {
                                message: "stream ended before completion".into(),
                                retryable: true,
                            })
                            .await;
                    }
                }
            }
        });

        Ok(rx)
    }
}

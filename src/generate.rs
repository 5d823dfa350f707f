//! Generation backend: turns an assembled prompt into answer text,
//! either in one shot or as a stream of incremental chunks.
//!
//! The one supported backend is the Gemini API. Retry strategy matches
//! the embedding client: HTTP 429 and 5xx retry with exponential
//! backoff (1s, 2s, 4s, ... capped at 2^5), other 4xx fail
//! immediately, network errors retry. A streaming request is never
//! retried once the first chunk has been delivered downstream.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::GenerationConfig;

pub const EMPTY_PROMPT_MESSAGE: &str = "Please provide a valid question.";
pub const DEGRADE_MESSAGE: &str =
    "I'm having trouble processing your request right now. Please try again later.";

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// A text-generation backend.
///
/// `stream` sends chunks into `tx` as they arrive; a closed receiver
/// means the client went away, and the implementation stops generating
/// without treating it as an error.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
    async fn stream(&self, prompt: &str, tx: mpsc::Sender<String>) -> Result<()>;
}

pub struct GeminiGenerator {
    config: GenerationConfig,
    client: reqwest::Client,
    api_key: String,
}

impl GeminiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            config: config.clone(),
            client,
            api_key,
        })
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": self.config.temperature },
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}:{}", GEMINI_BASE, self.config.model, method)
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let prompt = match prepare_prompt(prompt, self.config.max_prompt_chars) {
            Some(p) => p,
            None => return Ok(EMPTY_PROMPT_MESSAGE.to_string()),
        };

        let body = self.request_body(&prompt);
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(self.endpoint("generateContent"))
                .header("x-goog-api-key", &self.api_key)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return match extract_candidate_text(&json) {
                            Some(text) => Ok(text),
                            None => bail!("Gemini response had no candidate text"),
                        };
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("Gemini API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Gemini API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Gemini request failed")))
    }

    async fn stream(&self, prompt: &str, tx: mpsc::Sender<String>) -> Result<()> {
        let prompt = match prepare_prompt(prompt, self.config.max_prompt_chars) {
            Some(p) => p,
            None => {
                let _ = tx.send(EMPTY_PROMPT_MESSAGE.to_string()).await;
                return Ok(());
            }
        };

        let body = self.request_body(&prompt);
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}?alt=sse", self.endpoint("streamGenerateContent")))
                .header("x-goog-api-key", &self.api_key)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            let response = match resp {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!("Gemini API error {}: {}", status, body_text));
                    continue;
                }
                bail!("Gemini API error {}: {}", status, body_text);
            }

            match forward_sse_body(response, &tx).await {
                Ok(delivered) if delivered => return Ok(()),
                Ok(_) => {
                    // Stream ended without a single chunk. Treat as a
                    // transient failure and retry.
                    last_err = Some(anyhow::anyhow!("Gemini stream produced no text"));
                    continue;
                }
                Err(StreamFailure::MidStream(e)) => {
                    // Chunks already reached the client, so retrying
                    // would duplicate text. Surface the error instead.
                    return Err(e);
                }
                Err(StreamFailure::BeforeFirstChunk(e)) => {
                    last_err = Some(e);
                    continue;
                }
                Err(StreamFailure::ReceiverGone) => return Ok(()),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Gemini stream failed")))
    }
}

enum StreamFailure {
    BeforeFirstChunk(anyhow::Error),
    MidStream(anyhow::Error),
    ReceiverGone,
}

/// Read SSE lines off the response body and forward each text delta.
/// Returns whether at least one chunk was delivered.
async fn forward_sse_body(
    response: reqwest::Response,
    tx: &mpsc::Sender<String>,
) -> std::result::Result<bool, StreamFailure> {
    let mut body = response.bytes_stream();
    let mut buffer = String::new();
    let mut delivered = false;

    let classify = |e: anyhow::Error, delivered: bool| {
        if delivered {
            StreamFailure::MidStream(e)
        } else {
            StreamFailure::BeforeFirstChunk(e)
        }
    };

    while let Some(chunk) = body.next().await {
        let bytes = chunk.map_err(|e| classify(e.into(), delivered))?;
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);

            let Some(data) = sse_data_payload(&line) else {
                continue;
            };
            let json: serde_json::Value = serde_json::from_str(data)
                .map_err(|e| classify(anyhow::anyhow!("bad SSE payload: {}", e), delivered))?;

            if let Some(text) = extract_candidate_text(&json) {
                if !text.is_empty() {
                    if tx.send(text).await.is_err() {
                        return Err(StreamFailure::ReceiverGone);
                    }
                    delivered = true;
                }
            }
        }
    }

    Ok(delivered)
}

/// Trim, reject empty prompts, and clamp to the configured length.
fn prepare_prompt(prompt: &str, max_chars: usize) -> Option<String> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().count() <= max_chars {
        return Some(trimmed.to_string());
    }
    let mut clamped: String = trimmed.chars().take(max_chars).collect();
    clamped.push_str("...[truncated]");
    Some(clamped)
}

/// Pull the text out of a Gemini `generateContent` response or a single
/// streaming SSE payload (both share the candidates shape).
fn extract_candidate_text(json: &serde_json::Value) -> Option<String> {
    let parts = json
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn sse_data_payload(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_prompt_rejects_empty() {
        assert!(prepare_prompt("", 100).is_none());
        assert!(prepare_prompt("   \n  ", 100).is_none());
    }

    #[test]
    fn test_prepare_prompt_clamps_long_input() {
        let long = "x".repeat(50);
        let out = prepare_prompt(&long, 30).unwrap();
        assert_eq!(out, format!("{}...[truncated]", "x".repeat(30)));
        // Short prompts pass through untouched
        assert_eq!(prepare_prompt("short", 30).unwrap(), "short");
    }

    #[test]
    fn test_extract_candidate_text() {
        let json = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hello " }, { "text": "world" }] }
            }]
        });
        assert_eq!(extract_candidate_text(&json), Some("Hello world".to_string()));

        let empty = serde_json::json!({ "candidates": [] });
        assert_eq!(extract_candidate_text(&empty), None);
    }

    #[test]
    fn test_sse_data_payload() {
        assert_eq!(sse_data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data_payload("data:"), None);
        assert_eq!(sse_data_payload("data: [DONE]"), None);
        assert_eq!(sse_data_payload(": keepalive"), None);
        assert_eq!(sse_data_payload("event: message"), None);
    }
}

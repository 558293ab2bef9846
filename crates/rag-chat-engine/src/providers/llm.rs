use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LlmMessage, LlmProvider, LlmResponse, TokenStream, Usage};
use crate::config::LlmConfig;
use crate::utils::error::EngineError;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<LlmMessage>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions client (llama-server, vLLM, or a
/// hosted API behind the same shape).
pub struct OpenAiLlmClient {
    client: Client,
    config: LlmConfig,
}

impl OpenAiLlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
        }
    }

    fn request(
        &self,
        messages: Vec<LlmMessage>,
        temperature: Option<f32>,
        max_tokens: Option<usize>,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: max_tokens.unwrap_or(self.config.max_tokens),
            temperature: temperature.unwrap_or(self.config.temperature),
            stream,
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(&request);

        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        builder
    }
}

#[async_trait]
impl LlmProvider for OpenAiLlmClient {
    async fn complete(
        &self,
        messages: Vec<LlmMessage>,
        temperature: Option<f32>,
        max_tokens: Option<usize>,
    ) -> Result<LlmResponse, EngineError> {
        debug!(message_count = messages.len(), "llm_complete");

        let response = self
            .request(messages, temperature, max_tokens, false)
            .send()
            .await
            .map_err(|e| EngineError::provider("llm", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(
                "llm",
                format!("API error {status}: {body}"),
            ));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::provider("llm", e))?;

        let content = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            usage: body.usage.unwrap_or_default(),
            model: body.model.unwrap_or_else(|| self.config.model.clone()),
        })
    }

    async fn stream(
        &self,
        messages: Vec<LlmMessage>,
        temperature: Option<f32>,
        max_tokens: Option<usize>,
    ) -> Result<TokenStream, EngineError> {
        debug!(message_count = messages.len(), "llm_stream");

        let response = self
            .request(messages, temperature, max_tokens, true)
            .send()
            .await
            .map_err(|e| EngineError::provider("llm", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(
                "llm",
                format!("API error {status}: {body}"),
            ));
        }

        let mut bytes_stream = response.bytes_stream();

        // SSE lines can straddle network chunks; buffer until each
        // newline before parsing.
        let stream = async_stream::stream! {
            let mut buffer = String::new();

            while let Some(chunk) = bytes_stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(EngineError::provider("llm", format!("stream error: {e}")));
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };

                    if payload == "[DONE]" {
                        return;
                    }

                    if let Ok(parsed) = serde_json::from_str::<ChatCompletionChunk>(payload) {
                        if let Some(content) = parsed
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.clone())
                        {
                            if !content.is_empty() {
                                yield Ok(content);
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

use futures::future::BoxFuture;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use weft_core::config::ModelConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::GenerationService;

use super::catalog;
use crate::streaming::{SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible generation service. Works with OpenAI, Ollama, Groq, OpenRouter, etc.
pub struct OpenAiService {
    http: Client,
    config: ModelConfig,
}

impl OpenAiService {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The endpoint requests are sent to: explicit `base_url`, else the
    /// known provider's URL, else the OpenAI default.
    pub fn endpoint(&self) -> &str {
        if let Some(url) = self.config.base_url.as_deref() {
            return url;
        }
        catalog::lookup(&self.config.provider)
            .map(|p| p.chat_url)
            .unwrap_or(OPENAI_API_URL)
    }

    fn api_key(&self) -> Option<String> {
        let configured = self.config.api_key.as_deref();
        match catalog::lookup(&self.config.provider) {
            Some(provider) => provider.resolve_api_key(configured),
            None => configured.map(str::to_string),
        }
    }

    fn build_request(&self, system_prompt: &str, input: &str, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.config.model_id.clone(),
            messages: vec![
                OaiMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                OaiMessage {
                    role: "user".to_string(),
                    content: input.to_string(),
                },
            ],
            max_tokens: if self.config.max_tokens > 0 {
                Some(self.config.max_tokens)
            } else {
                None
            },
            temperature: self.config.temperature,
            stream,
        }
    }

    async fn send(&self, body: &ChatRequest) -> Result<reqwest::Response> {
        let mut req = self.http.post(self.endpoint()).json(body);

        if let Some(api_key) = self.api_key() {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| WeftError::GenerationRequest(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(WeftError::GenerationRequest(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        Ok(response)
    }
}

// Request types
#[derive(Serialize, Debug)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize, Debug)]
struct OaiMessage {
    role: String,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize, Debug)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize, Debug)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDeltaContent>,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

fn parse_completion(body: &str) -> Result<String> {
    let parsed: CompletionResponse =
        serde_json::from_str(body).map_err(|e| WeftError::GenerationParse(e.to_string()))?;

    parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content.unwrap_or_default())
        .ok_or_else(|| WeftError::GenerationParse("response contained no choices".into()))
}

/// Extract the text delta from one SSE event. `[DONE]`, empty deltas, and
/// unparseable chunks yield `None`.
pub(crate) fn parse_chunk(event: &SseEvent) -> Option<String> {
    if event.data.trim() == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<StreamChunk>(&event.data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .filter(|text| !text.is_empty()),
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse OpenAI SSE chunk");
            None
        }
    }
}

impl GenerationService for OpenAiService {
    fn generate(&self, system_prompt: &str, input: &str) -> BoxFuture<'_, Result<String>> {
        let body = self.build_request(system_prompt, input, false);

        Box::pin(async move {
            let response = self.send(&body).await?;
            let text = response
                .text()
                .await
                .map_err(|e| WeftError::GenerationRequest(e.to_string()))?;
            let content = parse_completion(&text)?;
            debug!(model = %self.config.model_id, chars = content.len(), "Generation complete");
            Ok(content)
        })
    }

    fn generate_streaming(
        &self,
        system_prompt: &str,
        input: &str,
        chunks: mpsc::UnboundedSender<String>,
    ) -> BoxFuture<'_, Result<String>> {
        let body = self.build_request(system_prompt, input, true);

        Box::pin(async move {
            let response = self.send(&body).await?;
            let mut events = SseStream::new(response.bytes_stream());
            let mut full_text = String::new();

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(
                            model = %self.config.model_id,
                            received = full_text.len(),
                            error = %e,
                            "Stream cut off mid-response"
                        );
                        return Err(e);
                    }
                };
                if let Some(text) = parse_chunk(&event) {
                    full_text.push_str(&text);
                    // Receiver may have gone away; the full text is still returned
                    let _ = chunks.send(text);
                }
            }

            debug!(
                model = %self.config.model_id,
                chars = full_text.len(),
                "Streaming generation complete"
            );
            Ok(full_text)
        })
    }
}

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use maestro_core::config::ModelConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::LlmClient;
use maestro_core::types::Message;

use crate::streaming::{SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub(crate) struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

impl<'a> ChatRequest<'a> {
    pub(crate) fn new(config: &'a ModelConfig, messages: &'a [Message]) -> Self {
        Self {
            model: Some(&config.model_id),
            messages,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            stream: true,
        }
    }

    /// Azure selects the model through the deployment in the URL.
    pub(crate) fn without_model(mut self) -> Self {
        self.model = None;
        self
    }
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

/// Extract the text fragment carried by one SSE event, if any.
pub(crate) fn parse_chunk(event: &SseEvent) -> Option<Result<String>> {
    if event.is_done() {
        return None;
    }

    match serde_json::from_str::<StreamChunk>(&event.data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|text| !text.is_empty())
            .map(Ok),
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse SSE chunk");
            None
        }
    }
}

/// Send a prepared request and turn the SSE body into text fragments.
pub(crate) async fn send_streaming(req: RequestBuilder) -> Result<BoxStream<'static, Result<String>>> {
    let response = req
        .send()
        .await
        .map_err(|e| MaestroError::LlmRequest(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        return Err(MaestroError::LlmRequest(format!("HTTP {}: {}", status, body)));
    }

    let sse = SseStream::new(response.bytes_stream());
    let fragments = sse
        .take_while(|event| {
            let done = matches!(event, Ok(e) if e.is_done());
            if done {
                debug!("Received end-of-stream sentinel");
            }
            futures::future::ready(!done)
        })
        .filter_map(|event| {
            futures::future::ready(match event {
                Ok(event) => parse_chunk(&event),
                Err(e) => Some(Err(e)),
            })
        });

    Ok(fragments.boxed())
}

impl LlmClient for OpenAiClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<Message>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        let config = config.clone();

        Box::pin(async move {
            let url = config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            let body = ChatRequest::new(&config, &messages);

            let mut req = self.http.post(url).json(&body);
            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let fragments = send_streaming(req).await?;
            Ok(fragments)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parse_text_delta() {
        let e = event(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#);
        assert_eq!(parse_chunk(&e).unwrap().unwrap(), "Hel");
    }

    #[test]
    fn test_parse_role_only_delta() {
        let e = event(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#);
        assert!(parse_chunk(&e).is_none());
    }

    #[test]
    fn test_parse_empty_choices_and_done() {
        assert!(parse_chunk(&event(r#"{"choices":[]}"#)).is_none());
        assert!(parse_chunk(&event("[DONE]")).is_none());
        assert!(parse_chunk(&event("not json")).is_none());
    }

    #[test]
    fn test_request_body_shape() {
        let config = ModelConfig::default();
        let messages = vec![Message::system("sys"), Message::user("hi")];
        let body = serde_json::to_value(ChatRequest::new(&config, &messages)).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][1]["role"], "user");

        let azure = serde_json::to_value(ChatRequest::new(&config, &messages).without_model()).unwrap();
        assert!(azure.get("model").is_none());
    }
}

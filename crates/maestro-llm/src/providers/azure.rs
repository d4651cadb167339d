use futures::future::BoxFuture;
use futures::stream::BoxStream;
use reqwest::Client;

use maestro_core::config::ModelConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::LlmClient;
use maestro_core::types::Message;

use super::openai::{send_streaming, ChatRequest};

const DEFAULT_API_VERSION: &str = "2024-02-15-preview";

/// Azure OpenAI client. Uses the same wire format as OpenAI but different
/// endpoint structure and `api-key` header instead of Bearer token.
pub struct AzureClient {
    http: Client,
}

impl AzureClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for AzureClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the chat-completions URL for a deployment.
pub(crate) fn deployment_url(config: &ModelConfig) -> Result<String> {
    let endpoint = config
        .base_url
        .as_deref()
        .ok_or_else(|| MaestroError::Config("Azure: base_url (resource endpoint) is required".into()))?;
    let deployment = config
        .azure_deployment
        .as_deref()
        .unwrap_or(&config.model_id);
    let api_version = config
        .azure_api_version
        .as_deref()
        .unwrap_or(DEFAULT_API_VERSION);

    Ok(format!(
        "{}/openai/deployments/{deployment}/chat/completions?api-version={api_version}",
        endpoint.trim_end_matches('/')
    ))
}

impl LlmClient for AzureClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<Message>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        let config = config.clone();

        Box::pin(async move {
            let url = deployment_url(&config)?;
            let api_key = config
                .api_key
                .as_deref()
                .ok_or_else(|| MaestroError::Config("Azure: api_key is required".into()))?;

            let body = ChatRequest::new(&config, &messages).without_model();
            let req = self
                .http
                .post(&url)
                .header("api-key", api_key)
                .json(&body);

            let fragments = send_streaming(req).await?;
            Ok(fragments)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_url() {
        let config = ModelConfig {
            base_url: Some("https://acme.openai.azure.com/".into()),
            azure_deployment: Some("gpt4o-prod".into()),
            ..ModelConfig::default()
        };
        assert_eq!(
            deployment_url(&config).unwrap(),
            "https://acme.openai.azure.com/openai/deployments/gpt4o-prod/chat/completions?api-version=2024-02-15-preview"
        );
    }

    #[test]
    fn test_deployment_falls_back_to_model_id() {
        let config = ModelConfig {
            base_url: Some("https://acme.openai.azure.com".into()),
            azure_api_version: Some("2024-06-01".into()),
            ..ModelConfig::default()
        };
        let url = deployment_url(&config).unwrap();
        assert!(url.contains("/deployments/gpt-4o/"));
        assert!(url.ends_with("api-version=2024-06-01"));
    }

    #[test]
    fn test_missing_endpoint_is_config_error() {
        let config = ModelConfig::default();
        assert!(matches!(deployment_url(&config), Err(MaestroError::Config(_))));
    }
}

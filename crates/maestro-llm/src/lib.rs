pub mod providers;
pub mod retry;
pub mod streaming;

use maestro_core::config::ModelConfig;
use maestro_core::traits::LlmClient;

pub use providers::azure::AzureClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    match config.provider.as_str() {
        "azure" | "azure_openai" => Box::new(AzureClient::new()),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new()),
    }
}

/// Create a provider client wrapped with timeout and retry handling.
pub fn create_resilient_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    Box::new(RetryingClient::from_config(create_client(config), config))
}

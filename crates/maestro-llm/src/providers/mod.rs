pub mod azure;
pub mod openai;

pub use azure::AzureClient;
pub use openai::OpenAiClient;

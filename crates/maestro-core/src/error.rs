use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaestroError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    // Request admission errors
    #[error("Input validation failed: {0}")]
    Validation(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs:.1}s")]
    RateLimited { retry_after_secs: f64 },

    // Handler errors
    #[error("Handler failed: {handler}: {message}")]
    Handler { handler: String, message: String },

    #[error("Task classification failed: {0}")]
    Classification(String),

    // Orchestration errors
    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Request cancelled")]
    Cancelled,

    // History errors
    #[error("A streaming message is already in progress")]
    StreamingActive,

    #[error("No streaming message in progress")]
    NoActiveStream,

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MaestroError {
    /// Whether this error ends a request before the graph runs.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::RateLimited { .. })
    }
}

pub type Result<T> = std::result::Result<T, MaestroError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections() {
        assert!(MaestroError::Validation("empty".into()).is_rejection());
        assert!(MaestroError::RateLimited { retry_after_secs: 2.0 }.is_rejection());
        assert!(!MaestroError::Cancelled.is_rejection());
        assert!(!MaestroError::Timeout(30).is_rejection());
    }
}

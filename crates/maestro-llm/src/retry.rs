use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::warn;

use maestro_core::config::{ModelConfig, RetryConfig};
use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::LlmClient;
use maestro_core::types::Message;

/// An LLM client that bounds every call with a timeout and retries
/// transient failures with exponential backoff.
///
/// The timeout applies to establishing the stream and, afterwards, to the
/// gap between consecutive fragments.
pub struct RetryingClient {
    inner: Box<dyn LlmClient>,
    retry_config: RetryConfig,
    timeout: Duration,
}

impl RetryingClient {
    pub fn new(inner: Box<dyn LlmClient>, retry_config: RetryConfig, timeout: Duration) -> Self {
        Self {
            inner,
            retry_config,
            timeout,
        }
    }

    /// Use the retry and timeout settings of a model config.
    pub fn from_config(inner: Box<dyn LlmClient>, config: &ModelConfig) -> Self {
        Self::new(
            inner,
            config.retry.clone().unwrap_or_default(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}

fn is_retryable(e: &MaestroError) -> bool {
    match e {
        MaestroError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("504")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        MaestroError::LlmStream(_) | MaestroError::Timeout(_) => true,
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// End the stream with a timeout error when no fragment arrives in time.
fn with_idle_timeout(
    fragments: BoxStream<'_, Result<String>>,
    idle: Duration,
) -> BoxStream<'_, Result<String>> {
    stream::unfold(Some(fragments), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout(idle, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => Some((Err(MaestroError::Timeout(idle.as_secs())), None)),
        }
    })
    .boxed()
}

impl LlmClient for RetryingClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<Message>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        let config = config.clone();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut last_err = None;

            for attempt in 0..=max_retries {
                let connect = self.inner.chat_stream(&config, messages.clone());
                let outcome = match tokio::time::timeout(self.timeout, connect).await {
                    Ok(result) => result,
                    Err(_) => Err(MaestroError::Timeout(self.timeout.as_secs())),
                };

                match outcome {
                    Ok(fragments) => return Ok(with_idle_timeout(fragments, self.timeout)),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying LLM request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| MaestroError::LlmRequest("LLM request failed".into())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_test_utils::MockLlm;

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = fast_retry(3);
        for attempt in 0..20 {
            let backoff = calculate_backoff(attempt, &config);
            assert!(backoff <= Duration::from_millis(120));
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&MaestroError::LlmRequest("HTTP 503: busy".into())));
        assert!(is_retryable(&MaestroError::Timeout(30)));
        assert!(!is_retryable(&MaestroError::LlmRequest("HTTP 401: bad key".into())));
        assert!(!is_retryable(&MaestroError::Config("missing".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let mock = MockLlm::new()
            .with_failure("HTTP 429: slow down")
            .with_failure("HTTP 502: bad gateway")
            .with_reply("ok");
        let calls = mock.call_counter();
        let client = RetryingClient::new(Box::new(mock), fast_retry(3), Duration::from_secs(5));

        let reply = client.chat(&ModelConfig::default(), vec![Message::user("hi")]).await.unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let mock = MockLlm::new()
            .with_failure("HTTP 500: a")
            .with_failure("HTTP 500: b")
            .with_failure("HTTP 500: c");
        let calls = mock.call_counter();
        let client = RetryingClient::new(Box::new(mock), fast_retry(1), Duration::from_secs(5));

        let err = client.chat(&ModelConfig::default(), vec![]).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 500: b"));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_fast() {
        let mock = MockLlm::new().with_failure("HTTP 401: unauthorized").with_reply("never");
        let calls = mock.call_counter();
        let client = RetryingClient::new(Box::new(mock), fast_retry(3), Duration::from_secs(5));

        assert!(client.chat(&ModelConfig::default(), vec![]).await.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_connect_times_out() {
        let mock = MockLlm::new().with_hang();
        let client = RetryingClient::new(Box::new(mock), fast_retry(0), Duration::from_secs(2));

        let err = client.chat(&ModelConfig::default(), vec![]).await.unwrap_err();
        assert!(matches!(err, MaestroError::Timeout(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_times_out() {
        let mock = MockLlm::new().with_stall_after(vec!["partial ".into()]);
        let client = RetryingClient::new(Box::new(mock), fast_retry(0), Duration::from_secs(2));

        let mut fragments = client
            .chat_stream(&ModelConfig::default(), vec![])
            .await
            .unwrap();
        assert_eq!(fragments.next().await.unwrap().unwrap(), "partial ");
        assert!(matches!(fragments.next().await, Some(Err(MaestroError::Timeout(2)))));
        assert!(fragments.next().await.is_none());
    }
}

use std::time::Duration;

use tracing::warn;

/// Retry policy for idempotent reads against the remote API.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    /// Seconds to wait before each retry.
    pub delays: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays: vec![1, 2, 4],
        }
    }
}

impl RetryConfig {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delays: Vec::new(),
        }
    }
}

/// Send a request built by `build`, retrying on network errors and 5xx
/// responses with the configured backoff.
///
/// Returns immediately on success or 4xx. Only use for requests that are
/// safe to repeat; writes go through exactly once.
pub async fn send_with_retry<F>(
    build: F,
    label: &str,
    config: &RetryConfig,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let max_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        let can_retry = attempt < config.max_retries && attempt < config.delays.len();
        match build().send().await {
            Ok(resp) if resp.status().is_server_error() && can_retry => {
                warn!(
                    "{label} attempt {}/{} failed (HTTP {}), retrying in {}s…",
                    attempt + 1,
                    max_attempts,
                    resp.status(),
                    config.delays[attempt],
                );
            }
            Ok(resp) => return Ok(resp),
            Err(e) if can_retry => {
                warn!(
                    "{label} attempt {}/{} failed ({}), retrying in {}s…",
                    attempt + 1,
                    max_attempts,
                    e,
                    config.delays[attempt],
                );
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(Duration::from_secs(config.delays[attempt])).await;
        attempt += 1;
    }
}

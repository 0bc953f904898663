use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often, and how far apart, a transient failure is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total tries, counting the first one
    pub max_attempts: u32,
    /// Pause between consecutive tries
    pub delay: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Store transactions racing a closing connection: three tries, 25ms apart.
    pub fn store_transaction() -> Self {
        Self::new(3, Duration::from_millis(25))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::store_transaction()
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the attempts run out.
///
/// The last error is returned unchanged. A `max_attempts` of 0 runs once.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} went through on try {}", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !should_retry(&err) {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(
                "{} still failing after {} tries: {}",
                operation_name, max_attempts, err
            );
            return Err(err);
        }

        debug!(
            "{} hit a transient error on try {}/{} ({}), trying again in {:?}",
            operation_name, attempt, max_attempts, err, config.delay
        );
        sleep(config.delay).await;
    }
}

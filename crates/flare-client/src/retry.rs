//! Retry with fixed backoff, interruptible by shutdown.
//!
//! Shutdown is a `watch` channel carrying `true` once the process should
//! stop. A dropped sender counts as shutdown.

use crate::error::ClientError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Sleep for `duration` unless shutdown arrives first.
///
/// # Errors
///
/// Returns [`ClientError::Shutdown`] if shutdown was requested before or
/// during the sleep.
pub async fn sleep(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> Result<(), ClientError> {
    if *shutdown.borrow() {
        return Err(ClientError::Shutdown);
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        _ = shutdown.wait_for(|stop| *stop) => Err(ClientError::Shutdown),
    }
}

/// Fixed-backoff retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between attempts
    pub backoff: Duration,
    /// Give up after this many attempts (`None` retries forever)
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry until success or shutdown
    #[must_use]
    pub const fn forever(backoff: Duration) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    /// Retry at most `attempts` times in total
    #[must_use]
    pub const fn limited(backoff: Duration, attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: Some(attempts),
        }
    }

    /// Run `op` until it succeeds.
    ///
    /// Failures are logged as warnings under `what`. The backoff wait holds
    /// nothing `op` borrowed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Shutdown`] if shutdown interrupts a backoff
    /// wait, the first error that is not [retryable](ClientError::is_retryable),
    /// or the last error once the attempt budget is spent.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        shutdown: &mut watch::Receiver<bool>,
        mut op: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() || self.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(e);
                    }
                    log_failure(what, attempt, &e, self.backoff);
                }
            }
            sleep(self.backoff, shutdown).await?;
        }
    }
}

fn log_failure(what: &str, attempt: u32, e: &impl Display, backoff: Duration) {
    tracing::warn!("{what} failed (attempt {attempt}): {e}; retrying in {backoff:?}");
}

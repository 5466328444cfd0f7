//! Bounded retry policies for calls to flaky collaborators (node RPCs, indexers, databases).
//!
//! A [`Strategy`] decides, per failed attempt, whether to try again and how long to wait first.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use tracing::debug;

/// Error handler deciding what to do after a failed attempt.
pub type ErrorHandler<E> = Arc<dyn Fn(&E, usize) -> RetryAction + Send + Sync>;

/// What to do after an attempt fails.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryAction {
    /// Sleep for the given delay, then try again.
    Retry(Duration),

    /// Give up and return the error.
    Stop,
}

/// A retry strategy: an error classifier plus an optional cap on retries.
pub struct Strategy<E> {
    error_handler: ErrorHandler<E>,
    max_retries: Option<usize>,
}

impl<E> Clone for Strategy<E> {
    fn clone(&self) -> Self {
        Self {
            error_handler: self.error_handler.clone(),
            max_retries: self.max_retries,
        }
    }
}

impl<E> fmt::Debug for Strategy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl<E> Strategy<E> {
    /// Creates a strategy from an error handler. Retries are unbounded until
    /// [`Self::with_max_retries`] is applied.
    pub fn new<F>(error_handler: F) -> Self
    where
        F: Fn(&E, usize) -> RetryAction + Send + Sync + 'static,
    {
        Self {
            error_handler: Arc::new(error_handler),
            max_retries: None,
        }
    }

    /// Caps the number of retries after the first attempt.
    pub const fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Returns the retry cap, if any.
    pub const fn max_retries(&self) -> Option<usize> {
        self.max_retries
    }

    /// Retries with a delay that grows by `unit` each attempt: `unit`, `2 * unit`, `3 * unit`...
    pub fn linear_backoff(unit: Duration) -> Self
    where
        E: 'static,
    {
        Self::new(move |_error, attempt| RetryAction::Retry(linear_delay(unit, attempt)))
    }

    /// Retries with the same delay every time.
    pub fn fixed_delay(delay: Duration) -> Self
    where
        E: 'static,
    {
        Self::new(move |_error, _attempt| RetryAction::Retry(delay))
    }

    /// Never retries.
    pub fn no_retry() -> Self
    where
        E: 'static,
    {
        Self::new(|_error, _attempt| RetryAction::Stop)
    }

    /// Consults `other_handler` whenever this strategy says stop.
    pub fn or<F>(self, other_handler: F) -> Self
    where
        F: Fn(&E, usize) -> RetryAction + Send + Sync + 'static,
        E: 'static,
    {
        let first_handler = self.error_handler;
        Self {
            error_handler: Arc::new(move |error, attempt| match first_handler(error, attempt) {
                RetryAction::Stop => other_handler(error, attempt),
                retry_action => retry_action,
            }),
            max_retries: self.max_retries,
        }
    }
}

/// Delay before retry number `attempt` (zero-based) under linear backoff.
pub fn linear_delay(unit: Duration, attempt: usize) -> Duration {
    unit.saturating_mul(u32::try_from(attempt + 1).unwrap_or(u32::MAX))
}

/// Runs `generator` until it succeeds or `strategy` gives up, returning the last error.
pub async fn retry_with<A, E, Fut, Gen>(strategy: &Strategy<E>, mut generator: Gen) -> Result<A, E>
where
    E: fmt::Debug,
    Fut: Future<Output = Result<A, E>>,
    Gen: FnMut() -> Fut,
{
    let mut attempt = 0;

    loop {
        match generator().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if strategy.max_retries.is_some_and(|max| attempt >= max) {
                    return Err(error);
                }

                match (strategy.error_handler)(&error, attempt) {
                    RetryAction::Retry(delay) => {
                        debug!(?error, attempt, ?delay, "attempt failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryAction::Stop => return Err(error),
                }
            }
        }
    }
}

//! Fixed-backoff retry wrapper

use crate::{RecognitionError, RecognitionResult, Recognition, Recognizer};
use lipwatch_common::FeatureVector;
use std::time::Duration;
use tracing::{error, warn};

/// How many extra attempts to make and how long to wait between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Retries the inner recognizer on retryable errors
///
/// After `retries + 1` failed attempts the last error is returned wrapped in
/// `RecognitionError::Exhausted`. Non-retryable errors are returned as-is
/// after the first attempt.
pub struct RetryingRecognizer<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: Recognizer> RetryingRecognizer<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

impl<R: Recognizer> Recognizer for RetryingRecognizer<R> {
    fn predict(&mut self, batch: &[FeatureVector]) -> RecognitionResult<Recognition> {
        let attempts = self.policy.retries + 1;
        let mut attempt = 1;
        loop {
            match self.inner.predict(batch) {
                Ok(recognition) => return Ok(recognition),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= attempts => {
                    error!("All {} recognition attempts failed: {}", attempts, e);
                    return Err(RecognitionError::Exhausted {
                        attempts,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!("Recognition attempt {} failed: {}", attempt, e);
                    std::thread::sleep(self.policy.backoff);
                    attempt += 1;
                }
            }
        }
    }
}

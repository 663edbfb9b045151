//! Recognition capability used by pipeline workers
//!
//! A [`Recognizer`] turns an ordered batch of feature vectors into text and a
//! confidence. Each worker owns its own instance; nothing here is shared
//! between threads.
//!
//! - [`HttpRecognizer`]: remote model service (`POST {url}/predict`)
//! - [`RetryingRecognizer`]: wraps any recognizer with a retry policy so the
//!   caller sees one logical call

pub mod http;
pub mod retry;

pub use http::HttpRecognizer;
pub use retry::{RetryPolicy, RetryingRecognizer};

use lipwatch_common::FeatureVector;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Recognition errors
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Empty batch")]
    EmptyBatch,

    #[error("Gave up after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<RecognitionError>,
    },

    #[error("Other error: {0}")]
    Other(String),
}

impl RecognitionError {
    /// Number of attempts behind this error
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// Whether another attempt could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Timeout(_) | Self::InvalidResponse(_))
    }
}

/// Result type for recognition operations
pub type RecognitionResult<T> = Result<T, RecognitionError>;

/// Output of one prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    /// Predicted text, possibly empty
    pub text: String,
    pub confidence: f32,
}

impl Recognition {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Batch of features in, text and confidence out
pub trait Recognizer: Send {
    /// # Errors
    ///
    /// Returns an error if the prediction fails. Implementations with their
    /// own retry policy report `RecognitionError::Exhausted`.
    fn predict(&mut self, batch: &[FeatureVector]) -> RecognitionResult<Recognition>;
}

impl<F> Recognizer for F
where
    F: FnMut(&[FeatureVector]) -> RecognitionResult<Recognition> + Send,
{
    fn predict(&mut self, batch: &[FeatureVector]) -> RecognitionResult<Recognition> {
        self(batch)
    }
}

/// Recognition service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Base URL of the model service
    pub url: Option<String>,
    /// Per-request timeout
    pub timeout_ms: u64,
    /// Extra attempts after the first failure
    pub retries: u32,
    /// Fixed delay between attempts
    pub retry_backoff_ms: u64,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 5000,
            retries: 2,
            retry_backoff_ms: 200,
        }
    }
}

impl RecognizerConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Build the HTTP recognizer described by this configuration, wrapped in
    /// its retry policy
    ///
    /// # Errors
    ///
    /// Returns `RecognitionError::Other` if no URL is configured or the HTTP
    /// client cannot be created.
    pub fn build(&self) -> RecognitionResult<Box<dyn Recognizer>> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| RecognitionError::Other("No recognizer URL configured".to_string()))?;
        let http = HttpRecognizer::new(url, Duration::from_millis(self.timeout_ms))?;
        Ok(Box::new(RetryingRecognizer::new(http, self.retry_policy())))
    }
}

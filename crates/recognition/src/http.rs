//! HTTP client for the remote recognition service
//!
//! `POST {base_url}/predict` with `{"sequence": [[f32, ...], ...]}`, one inner
//! array per frame. The service answers `{"text": "...", "confidence": 0.0}`;
//! missing fields default to empty text and zero confidence.

use crate::{RecognitionError, RecognitionResult, Recognition, Recognizer};
use lipwatch_common::FeatureVector;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    sequence: Vec<&'a [f32]>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: f32,
}

/// Blocking client for one recognition service endpoint
#[derive(Debug, Clone)]
pub struct HttpRecognizer {
    client: reqwest::blocking::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpRecognizer {
    /// # Errors
    ///
    /// Returns `RecognitionError::Other` if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> RecognitionResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RecognitionError::Other(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/predict", base_url.trim_end_matches('/')),
            timeout,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Recognizer for HttpRecognizer {
    fn predict(&mut self, batch: &[FeatureVector]) -> RecognitionResult<Recognition> {
        if batch.is_empty() {
            return Err(RecognitionError::EmptyBatch);
        }

        let request = PredictRequest {
            sequence: batch.iter().map(|f| f.values.as_slice()).collect(),
        };
        debug!("POST {} ({} frames)", self.endpoint, batch.len());

        let transport = |e: reqwest::Error| {
            if e.is_timeout() {
                RecognitionError::Timeout(self.timeout)
            } else {
                RecognitionError::Request(e.to_string())
            }
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(transport)?
            .error_for_status()
            .map_err(|e| RecognitionError::Request(e.to_string()))?;

        let body: PredictResponse = response
            .json()
            .map_err(|e| RecognitionError::InvalidResponse(e.to_string()))?;

        Ok(Recognition {
            text: body.text.unwrap_or_default(),
            confidence: body.confidence,
        })
    }
}

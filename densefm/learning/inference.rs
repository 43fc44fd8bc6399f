use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use ndarray::ArrayView2;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::split_rows;

/// One row of an inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Dense feature vector.
    pub features: Vec<f32>,
}

/// Body of `POST <endpoint>` with content type `application/json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Rows to score, in order.
    pub instances: Vec<Instance>,
}

impl InferenceRequest {
    /// Builds a request from matrix rows.
    #[must_use]
    pub fn from_rows(features: ArrayView2<'_, f32>) -> Self {
        Self {
            instances: features
                .rows()
                .into_iter()
                .map(|row| Instance {
                    features: row.to_vec(),
                })
                .collect(),
        }
    }

    /// Number of rows in the request.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the request carries no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Score for one row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Raw model output (probability for binary classifiers).
    pub score: f32,
    /// Thresholded class, or the regression value.
    pub predicted_label: f32,
}

/// Endpoint response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    /// One prediction per request row, in request order.
    pub predictions: Vec<Prediction>,
}

/// Errors raised while calling an endpoint.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Transport or HTTP status failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// Endpoint returned a different number of predictions than rows sent.
    #[error("endpoint returned {returned} predictions for {sent} rows")]
    CountMismatch {
        /// Rows in the request.
        sent: usize,
        /// Predictions in the response.
        returned: usize,
    },
    /// Request rejected before sending.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Prediction endpoint boundary.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Scores every row, returning predictions in row order.
    async fn predict(&self, features: ArrayView2<'_, f32>) -> Result<Vec<Prediction>, InferenceError>;
}

/// JSON-over-HTTP predictor.
#[derive(Debug, Clone)]
pub struct HttpPredictor {
    client: Client,
    url: String,
    bearer_token: Option<String>,
}

impl HttpPredictor {
    /// Creates a predictor for `url` with a per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, InferenceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            bearer_token: None,
        })
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends a prebuilt request.
    pub async fn send(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let mut req = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, "application/json")
            .json(request);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        let response = req.send().await?.error_for_status()?;
        let body: InferenceResponse = response.json().await?;
        if body.predictions.len() != request.len() {
            return Err(InferenceError::CountMismatch {
                sent: request.len(),
                returned: body.predictions.len(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, features: ArrayView2<'_, f32>) -> Result<Vec<Prediction>, InferenceError> {
        if features.nrows() == 0 {
            return Ok(Vec::new());
        }
        let request = InferenceRequest::from_rows(features);
        Ok(self.send(&request).await?.predictions)
    }
}

/// Scores `features` in `batches` chunks with up to `concurrency` requests in flight.
///
/// Predictions come back in row order regardless of completion order.
pub async fn predict_in_batches<P: Predictor + ?Sized>(
    predictor: &P,
    features: ArrayView2<'_, f32>,
    batches: usize,
    concurrency: usize,
) -> Result<Vec<Prediction>, InferenceError> {
    if batches == 0 {
        return Err(InferenceError::InvalidRequest("batches must be > 0".into()));
    }
    let chunks = split_rows(features, batches);
    let per_chunk: Vec<Vec<Prediction>> = stream::iter(chunks)
        .map(|chunk| async move {
            let predictions = predictor.predict(chunk).await?;
            if predictions.len() == chunk.nrows() {
                Ok(predictions)
            } else {
                Err(InferenceError::CountMismatch {
                    sent: chunk.nrows(),
                    returned: predictions.len(),
                })
            }
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;
    Ok(per_chunk.into_iter().flatten().collect())
}

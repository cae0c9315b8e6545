use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use facewatch_core::Snapshot;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("recognition request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("recognition service returned HTTP {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("recognition rejected: {0}")]
    Rejected(String),
    #[error("response is missing a label or secondary id")]
    Incomplete,
}

/// A real-world identity reported by the recognition service.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub label: String,
    pub secondary_id: String,
    pub confidence: Option<f32>,
}

/// External service that names a face from its snapshot.
#[async_trait]
pub trait RecognitionService: Send + Sync {
    async fn recognize(&self, snapshot: &Snapshot) -> Result<Recognition, RecognitionError>;
}

#[derive(Serialize)]
struct RecognizeRequest<'a> {
    image_base64: &'a str,
}

#[derive(Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    success: bool,
    data: Option<RecognizeData>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct RecognizeData {
    #[serde(alias = "name")]
    label: Option<String>,
    #[serde(alias = "id_card")]
    secondary_id: Option<String>,
    confidence: Option<f32>,
}

/// JSON-over-HTTP recognition client.
pub struct HttpRecognizer {
    client: Client,
    url: String,
}

impl HttpRecognizer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RecognitionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecognitionError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RecognitionService for HttpRecognizer {
    async fn recognize(&self, snapshot: &Snapshot) -> Result<Recognition, RecognitionError> {
        let encoded = STANDARD.encode(&snapshot.data);
        let resp = self
            .client
            .post(&self.url)
            .json(&RecognizeRequest {
                image_base64: &encoded,
            })
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RecognitionError::Status(status.as_u16()));
        }
        let body = resp.bytes().await.map_err(classify)?;
        interpret(&body)
    }
}

fn classify(err: reqwest::Error) -> RecognitionError {
    if err.is_timeout() {
        RecognitionError::Timeout
    } else {
        RecognitionError::Transport(err.to_string())
    }
}

/// Decode a service reply. Blank names count as missing.
fn interpret(body: &[u8]) -> Result<Recognition, RecognitionError> {
    let resp: RecognizeResponse =
        serde_json::from_slice(body).map_err(|e| RecognitionError::Malformed(e.to_string()))?;
    if !resp.success {
        return Err(RecognitionError::Rejected(
            resp.error.unwrap_or_else(|| "unspecified".to_string()),
        ));
    }
    let data = resp.data.ok_or(RecognitionError::Incomplete)?;
    let label = non_blank(data.label).ok_or(RecognitionError::Incomplete)?;
    let secondary_id = non_blank(data.secondary_id).ok_or(RecognitionError::Incomplete)?;
    Ok(Recognition {
        label,
        secondary_id,
        confidence: data.confidence,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

//! Upload of finished recordings to the dialogue server

use reqwest::multipart::{Form, Part};

use crate::voice::RecordedBlob;
use crate::{Error, Result};

/// Name every upload is stored under
pub const UPLOAD_FILENAME: &str = "audio.wav";

/// Posts recordings to `{api_url}/upload_audio`
#[derive(Debug, Clone)]
pub struct Uploader {
    client: reqwest::Client,
    endpoint: String,
}

impl Uploader {
    /// Create an uploader for the given API base URL
    #[must_use]
    pub fn new(api_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/upload_audio", api_url.trim_end_matches('/')),
        }
    }

    /// Full upload URL
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Upload one recording as multipart field `audio`
    ///
    /// Returns the filename the server should process. Never retries.
    ///
    /// # Errors
    ///
    /// Returns `Error::Network` on transport failure or a non-2xx status
    pub async fn upload(&self, blob: &RecordedBlob) -> Result<String> {
        tracing::debug!(
            endpoint = %self.endpoint,
            bytes = blob.as_bytes().len(),
            "uploading recording"
        );

        let part = Part::bytes(blob.as_bytes().to_vec())
            .file_name(UPLOAD_FILENAME)
            .mime_str("audio/wav")
            .map_err(|e| Error::Network(e.to_string()))?;
        let form = Form::new().part("audio", part);

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "upload request failed");
                Error::Network(format!("upload failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "upload rejected");
            return Err(Error::Network(format!("upload returned {status}: {body}")));
        }

        tracing::info!(
            status = %status,
            secs = blob.duration().as_secs_f32(),
            "recording uploaded"
        );
        Ok(UPLOAD_FILENAME.to_string())
    }
}

use crate::OPENAI_API_BASE;
use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

// Speech-to-text for a recorded answer. The session treats the transcript as
// untrusted: it is trimmed, and an empty result counts as a failed
// transcription rather than an empty answer. Implementations can therefore
// return whatever the service produced without cleaning it up.
//
// Like the other adapters, `mockall` generates `MockTranscriber` for unit
// tests, so the pipeline can be driven without a network.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Transcribes through the OpenAI `audio/transcriptions` endpoint.
pub struct WhisperClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl WhisperClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, OPENAI_API_BASE.to_string())
    }

    pub fn with_base_url(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperClient {
    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        let file = Part::bytes(audio.to_vec())
            .file_name("answer.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", file);

        let resp = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("transcription request failed")?
            .error_for_status()
            .context("transcription service returned an error")?
            .json::<TranscriptionResponse>()
            .await
            .context("transcription response was not valid JSON")?;

        Ok(resp.text)
    }
}

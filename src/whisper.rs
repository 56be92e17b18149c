use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::colpali::normalize_err_body;

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav_path: &Path) -> Result<String>;
}

/// Client for a whisper.cpp-style transcription server.
#[derive(Clone)]
pub struct WhisperClient {
    client: Client,
    base_url: String,
}

impl WhisperClient {
    /// `insecure_tls` skips certificate verification, for servers behind
    /// self-signed proxies.
    pub fn new(base_url: impl Into<String>, timeout: Duration, insecure_tls: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .context("failed to build transcription http client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn load_model(&self, model_path: &Path, size: &str) -> Result<WhisperModel> {
        let form = Form::new().text("model", model_path.display().to_string());

        let url = format!("{}/load", self.base_url);
        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .context("failed to contact transcription server during load")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "transcription server /load returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        Ok(WhisperModel {
            client: self.clone(),
            size: size.to_string(),
        })
    }
}

#[derive(Clone)]
pub struct WhisperModel {
    client: WhisperClient,
    size: String,
}

impl WhisperModel {
    pub fn size(&self) -> &str {
        &self.size
    }
}

#[async_trait]
impl Transcriber for WhisperModel {
    async fn transcribe(&self, wav_path: &Path) -> Result<String> {
        #[derive(Deserialize)]
        struct InferenceResp {
            text: String,
        }

        let bytes = tokio::fs::read(wav_path)
            .await
            .with_context(|| format!("failed to read audio clip {}", wav_path.display()))?;

        let file = Part::bytes(bytes)
            .file_name("clip.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .part("file", file)
            .text("response_format", "json")
            .text("temperature", "0.0");

        let url = format!("{}/inference", self.client.base_url);
        let response = self
            .client
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .context("failed to call transcription endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "transcription server /inference returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let response = response
            .json::<InferenceResp>()
            .await
            .context("failed to decode transcription response")?;

        Ok(response.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_model_and_transcribes() {
        let mut server = mockito::Server::new_async().await;
        let load = server
            .mock("POST", "/load")
            .match_body(mockito::Matcher::Regex("ggml-base.bin".to_string()))
            .with_body(r#"{"status":"ok"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/inference")
            .with_body(r#"{"text":"  red summer dress \n"}"#)
            .create_async()
            .await;

        let client = WhisperClient::new(server.url(), Duration::from_secs(5), false).unwrap();
        let model = client
            .load_model(Path::new("models/ggml-base.bin"), "base")
            .await
            .unwrap();
        load.assert_async().await;
        assert_eq!(model.size(), "base");

        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("clip.wav");
        std::fs::write(&wav, b"RIFF").unwrap();

        assert_eq!(model.transcribe(&wav).await.unwrap(), "red summer dress");
    }

    #[tokio::test]
    async fn load_failure_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/load")
            .with_status(500)
            .with_body("model file missing")
            .create_async()
            .await;

        let client = WhisperClient::new(server.url(), Duration::from_secs(5), true).unwrap();
        let err = client
            .load_model(Path::new("models/ggml-tiny.bin"), "tiny")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("model file missing"));
    }
}

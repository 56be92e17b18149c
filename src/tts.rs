use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::colpali::normalize_err_body;
use crate::config::TtsConfig;

/// OpenAI-compatible speech synthesis.
#[derive(Clone)]
pub struct TtsClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
}

impl TtsClient {
    /// Returns `None` when no API key is configured.
    pub fn from_config(config: &TtsConfig, timeout: Duration) -> Result<Option<Self>> {
        let Some(api_key) = config.api_key.clone() else {
            return Ok(None);
        };

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build tts http client")?;

        Ok(Some(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            voice: config.voice.clone(),
        }))
    }

    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct SpeechReq<'a> {
            model: &'a str,
            voice: &'a str,
            input: &'a str,
        }

        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot synthesize empty text");
        }

        tracing::info!("generating speech for {} characters", input.chars().count());

        let url = format!("{}/v1/audio/speech", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&SpeechReq {
                model: &self.model,
                voice: &self.voice,
                input,
            })
            .send()
            .await
            .context("failed to call speech endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "speech endpoint returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let audio = response
            .bytes()
            .await
            .context("failed to read speech audio")?;
        Ok(audio.to_vec())
    }
}

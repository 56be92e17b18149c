use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

/// One embedding vector per query token or image patch.
pub type MultiVector = Vec<Vec<f32>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cuda,
    Mps,
    Cpu,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Mps => "mps",
            Device::Cpu => "cpu",
        }
    }
}

/// Devices to try, most preferred first. Always ends with the CPU.
pub fn device_candidates(preference: &str) -> Result<Vec<Device>> {
    let candidates = match preference.trim().to_ascii_lowercase().as_str() {
        "auto" | "" => vec![Device::Cuda, Device::Mps, Device::Cpu],
        "cuda" => vec![Device::Cuda, Device::Cpu],
        "mps" => vec![Device::Mps, Device::Cpu],
        "cpu" => vec![Device::Cpu],
        other => anyhow::bail!("unknown retrieval device preference: {other}"),
    };
    Ok(candidates)
}

/// HTTP client for the page retrieval inference server.
#[derive(Clone)]
pub struct ColPaliClient {
    client: Client,
    base_url: String,
}

impl ColPaliClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build retrieval http client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Loads `model` on the first device the server accepts, walking the
    /// preference list down to the CPU.
    pub async fn load(&self, model: &str, device_preference: &str) -> Result<ColPaliModel> {
        let mut errors = Vec::new();

        for device in device_candidates(device_preference)? {
            match self.load_on(model, device).await {
                Ok(loaded) => {
                    tracing::info!(
                        "retrieval model {} loaded on {}",
                        loaded.model,
                        loaded.device.as_str()
                    );
                    return Ok(loaded);
                }
                Err(err) => {
                    tracing::info!(
                        "retrieval model {} not loadable on {}: {}",
                        model,
                        device.as_str(),
                        err
                    );
                    errors.push(format!("{}: {}", device.as_str(), err));
                }
            }
        }

        Err(anyhow::anyhow!(
            "failed to load retrieval model {model} on any device ({})",
            errors.join("; ")
        ))
    }

    async fn load_on(&self, model: &str, device: Device) -> Result<ColPaliModel> {
        #[derive(Serialize)]
        struct LoadReq<'a> {
            model: &'a str,
            device: &'a str,
        }

        #[derive(Deserialize)]
        struct LoadResp {
            model: String,
            device: Option<String>,
        }

        let url = format!("{}/load", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&LoadReq {
                model,
                device: device.as_str(),
            })
            .send()
            .await
            .context("failed to contact retrieval server during load")?;

        let response: LoadResp = decode_json(response, "/load").await?;

        let device = match response.device.as_deref() {
            Some("cuda") => Device::Cuda,
            Some("mps") => Device::Mps,
            Some("cpu") => Device::Cpu,
            _ => device,
        };

        Ok(ColPaliModel {
            client: self.clone(),
            model: response.model,
            device,
        })
    }
}

/// A model the inference server has confirmed as loaded.
#[derive(Clone)]
pub struct ColPaliModel {
    client: ColPaliClient,
    model: String,
    device: Device,
}

#[derive(Deserialize)]
struct EmbedResp {
    embeddings: Vec<MultiVector>,
}

impl ColPaliModel {
    pub fn name(&self) -> &str {
        &self.model
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub async fn embed_query(&self, query: &str) -> Result<MultiVector> {
        #[derive(Serialize)]
        struct QueryReq<'a> {
            model: &'a str,
            queries: [&'a str; 1],
        }

        let query = query.trim();
        if query.is_empty() {
            anyhow::bail!("cannot embed empty query");
        }

        let url = format!("{}/embed/queries", self.client.base_url);
        let response = self
            .client
            .client
            .post(url)
            .json(&QueryReq {
                model: &self.model,
                queries: [query],
            })
            .send()
            .await
            .context("failed to call retrieval query embedding endpoint")?;

        let response: EmbedResp = decode_json(response, "/embed/queries").await?;
        let embedding = response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("/embed/queries returned no embeddings"))?;

        if embedding.is_empty() {
            anyhow::bail!("/embed/queries returned an empty multi-vector");
        }
        Ok(embedding)
    }

    pub async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<MultiVector>> {
        #[derive(Serialize)]
        struct ImageReq<'a> {
            model: &'a str,
            images: Vec<String>,
        }

        if images.is_empty() {
            return Ok(vec![]);
        }

        let encoded = images
            .iter()
            .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
            .collect();

        let url = format!("{}/embed/images", self.client.base_url);
        let response = self
            .client
            .client
            .post(url)
            .json(&ImageReq {
                model: &self.model,
                images: encoded,
            })
            .send()
            .await
            .context("failed to call retrieval image embedding endpoint")?;

        let response: EmbedResp = decode_json(response, "/embed/images").await?;
        if response.embeddings.len() != images.len() {
            anyhow::bail!(
                "/embed/images returned {} embeddings for {} images",
                response.embeddings.len(),
                images.len()
            );
        }

        Ok(response.embeddings)
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    endpoint: &str,
) -> Result<T> {
    if response.status() != StatusCode::OK {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!(
            "retrieval server {endpoint} returned {status}: {}",
            normalize_err_body(&body)
        );
    }

    response
        .json::<T>()
        .await
        .with_context(|| format!("failed to decode retrieval server {endpoint} response"))
}

pub(crate) fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        for key in ["error", "detail"] {
            if let Some(err) = json.get(key).and_then(|v| v.as_str()) {
                return err.to_string();
            }
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: String) -> ColPaliClient {
        ColPaliClient::new(url, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn device_preferences_end_on_cpu() {
        assert_eq!(
            device_candidates("auto").unwrap(),
            vec![Device::Cuda, Device::Mps, Device::Cpu]
        );
        assert_eq!(
            device_candidates("MPS").unwrap(),
            vec![Device::Mps, Device::Cpu]
        );
        assert_eq!(device_candidates("cpu").unwrap(), vec![Device::Cpu]);
        assert!(device_candidates("tpu").is_err());
    }

    #[test]
    fn error_bodies_prefer_message_fields() {
        assert_eq!(normalize_err_body(""), "<empty body>");
        assert_eq!(normalize_err_body(r#"{"detail":"no mps"}"#), "no mps");
        assert_eq!(normalize_err_body("plain failure"), "plain failure");
    }

    #[tokio::test]
    async fn load_falls_back_to_cpu() {
        let mut server = mockito::Server::new_async().await;
        let accelerated = server
            .mock("POST", "/load")
            .match_body(mockito::Matcher::Regex(r#""device":"(cuda|mps)""#.to_string()))
            .with_status(400)
            .with_body(r#"{"detail":"device not available"}"#)
            .expect(2)
            .create_async()
            .await;
        let cpu = server
            .mock("POST", "/load")
            .match_body(mockito::Matcher::Regex(r#""device":"cpu""#.to_string()))
            .with_status(200)
            .with_body(r#"{"model":"vidore/colpali","device":"cpu"}"#)
            .create_async()
            .await;

        let model = client(server.url())
            .load("vidore/colpali", "auto")
            .await
            .unwrap();

        assert_eq!(model.device(), Device::Cpu);
        assert_eq!(model.name(), "vidore/colpali");
        accelerated.assert_async().await;
        cpu.assert_async().await;
    }

    #[tokio::test]
    async fn load_fails_when_no_device_works() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/load")
            .with_status(500)
            .with_body(r#"{"error":"model not found"}"#)
            .create_async()
            .await;

        let err = client(server.url())
            .load("missing/model", "cpu")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("model not found"));
    }

    #[tokio::test]
    async fn embeds_query_and_images() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/load")
            .with_body(r#"{"model":"vidore/colpali","device":"cpu"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/embed/queries")
            .with_body(r#"{"embeddings":[[[1.0,0.0],[0.0,1.0]]]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/embed/images")
            .with_body(r#"{"embeddings":[[[0.5,0.5]],[[1.0,0.0]]]}"#)
            .create_async()
            .await;

        let model = client(server.url())
            .load("vidore/colpali", "cpu")
            .await
            .unwrap();

        let query = model.embed_query("red dress").await.unwrap();
        assert_eq!(query.len(), 2);

        let pages = model
            .embed_images(&[vec![1, 2, 3], vec![4, 5, 6]])
            .await
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1][0], vec![1.0, 0.0]);

        assert!(model.embed_query("   ").await.is_err());
    }
}

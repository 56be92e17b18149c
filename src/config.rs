use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use reqwest::Url;

use crate::colpali::device_candidates;

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub base_url: String,
    pub model: String,
    pub device: String,
    pub index_name: String,
    pub top_k: usize,
    pub recall_multiplier: usize,
    pub recall_min: usize,
    pub inference_concurrency: usize,
    pub image_batch_size: usize,
    pub render_dpi: u32,
}

#[derive(Clone, Debug)]
pub struct ChromaConfig {
    pub base_url: String,
    pub collection: String,
}

#[derive(Clone, Debug)]
pub struct WhisperConfig {
    pub base_url: String,
    pub model_size: String,
    pub models_dir: PathBuf,
    pub insecure_tls: bool,
}

#[derive(Clone, Debug)]
pub struct VoiceConfig {
    pub duration_secs: u32,
    pub sample_rate: u32,
}

#[derive(Clone, Debug)]
pub struct TtsConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub cors_origins: Vec<String>,
    pub initial_document: Option<PathBuf>,
    pub placeholder_document: PathBuf,
    pub placeholder_fallback: bool,
    pub backend_timeout_secs: u64,
    pub retrieval: RetrievalConfig,
    pub chroma: ChromaConfig,
    pub whisper: WhisperConfig,
    pub voice: VoiceConfig,
    pub tts: TtsConfig,
}

impl AppConfig {
    /// Reads configuration from the process environment. Call `dotenvy::dotenv()`
    /// first if a `.env` file should take part.
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("PAGEFINDER_BIND", "127.0.0.1:8000"),
            data_dir: PathBuf::from(env_or("DATA_DIR", "./data")),
            upload_dir: PathBuf::from(env_or("UPLOAD_DIR", "./doc")),
            cors_origins: env_or("CORS_ORIGINS", "http://localhost:3000,http://localhost")
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect(),
            initial_document: env::var("INITIAL_DOCUMENT_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            placeholder_document: PathBuf::from(env_or(
                "PLACEHOLDER_DOCUMENT_PATH",
                "./test_document.pdf",
            )),
            placeholder_fallback: env_flag("INDEX_PLACEHOLDER_FALLBACK", true),
            backend_timeout_secs: env_parse("BACKEND_TIMEOUT_SECS", 120),
            retrieval: RetrievalConfig {
                base_url: env_or("RETRIEVAL_BASE_URL", "http://127.0.0.1:8010"),
                model: env_or(
                    "RETRIEVAL_MODEL",
                    "gajanhcc/finetune_colpali_v1_2-own400_steps",
                ),
                device: env_or("RETRIEVAL_DEVICE", "auto"),
                index_name: env_or("INDEX_NAME", "document_index"),
                top_k: env_parse("SEARCH_TOP_K", 3),
                recall_multiplier: env_parse("RECALL_MULTIPLIER", 8),
                recall_min: env_parse("RECALL_MIN", 32),
                inference_concurrency: env_parse("INFERENCE_CONCURRENCY", 1),
                image_batch_size: env_parse("IMAGE_BATCH_SIZE", 4),
                render_dpi: env_parse("RENDER_DPI", 100),
            },
            chroma: ChromaConfig {
                base_url: env_or("CHROMA_BASE_URL", "http://127.0.0.1:8001"),
                collection: env_or("CHROMA_COLLECTION", "document_index"),
            },
            whisper: WhisperConfig {
                base_url: env_or("WHISPER_BASE_URL", "http://127.0.0.1:8080"),
                model_size: env_or("WHISPER_MODEL", "base"),
                models_dir: PathBuf::from(env_or("WHISPER_MODELS_DIR", "models")),
                insecure_tls: env_flag("WHISPER_INSECURE_TLS", false),
            },
            voice: VoiceConfig {
                duration_secs: env_parse("VOICE_DURATION_SECS", 5),
                sample_rate: env_parse("VOICE_SAMPLE_RATE", 44_100),
            },
            tts: TtsConfig {
                base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com"),
                api_key: env::var("OPENAI_API_KEY")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
                model: env_or("TTS_MODEL", "tts-1"),
                voice: env_or("TTS_VOICE", "alloy"),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind address: {}", self.bind_addr))?;

        for (name, url) in [
            ("RETRIEVAL_BASE_URL", &self.retrieval.base_url),
            ("CHROMA_BASE_URL", &self.chroma.base_url),
            ("WHISPER_BASE_URL", &self.whisper.base_url),
            ("OPENAI_BASE_URL", &self.tts.base_url),
        ] {
            let parsed = Url::parse(url).with_context(|| format!("{name} is not a URL: {url}"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("{name} must use http or https: {url}");
            }
        }

        device_candidates(&self.retrieval.device)?;

        if self.retrieval.model.trim().is_empty() {
            anyhow::bail!("RETRIEVAL_MODEL must not be empty");
        }
        if self.retrieval.index_name.trim().is_empty() {
            anyhow::bail!("INDEX_NAME must not be empty");
        }
        if self.chroma.collection.trim().is_empty() {
            anyhow::bail!("CHROMA_COLLECTION must not be empty");
        }

        for (name, value) in [
            ("SEARCH_TOP_K", self.retrieval.top_k),
            ("RECALL_MULTIPLIER", self.retrieval.recall_multiplier),
            ("INFERENCE_CONCURRENCY", self.retrieval.inference_concurrency),
            ("IMAGE_BATCH_SIZE", self.retrieval.image_batch_size),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }

        if self.retrieval.render_dpi == 0 {
            anyhow::bail!("RENDER_DPI must be greater than zero");
        }
        if self.voice.duration_secs == 0 || self.voice.sample_rate == 0 {
            anyhow::bail!("voice duration and sample rate must be greater than zero");
        }
        if self.backend_timeout_secs == 0 {
            anyhow::bail!("BACKEND_TIMEOUT_SECS must be greater than zero");
        }

        Ok(())
    }

    pub fn page_store_dsn(&self) -> String {
        format!(
            "sqlite://{}",
            self.data_dir.join("index.sqlite3").display()
        )
    }

    pub fn whisper_model_path(&self) -> PathBuf {
        self.whisper
            .models_dir
            .join(format!("ggml-{}.bin", self.whisper.model_size))
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
pub(crate) fn test_config(data_dir: &std::path::Path) -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        data_dir: data_dir.to_path_buf(),
        upload_dir: data_dir.join("doc"),
        cors_origins: vec![
            "http://localhost:3000".to_string(),
            "http://localhost".to_string(),
        ],
        initial_document: None,
        placeholder_document: data_dir.join("test_document.pdf"),
        placeholder_fallback: true,
        backend_timeout_secs: 5,
        retrieval: RetrievalConfig {
            base_url: "http://127.0.0.1:8010".to_string(),
            model: "vidore/colpali".to_string(),
            device: "auto".to_string(),
            index_name: "document_index".to_string(),
            top_k: 3,
            recall_multiplier: 8,
            recall_min: 32,
            inference_concurrency: 1,
            image_batch_size: 4,
            render_dpi: 100,
        },
        chroma: ChromaConfig {
            base_url: "http://127.0.0.1:8001".to_string(),
            collection: "document_index".to_string(),
        },
        whisper: WhisperConfig {
            base_url: "http://127.0.0.1:8080".to_string(),
            model_size: "base".to_string(),
            models_dir: PathBuf::from("models"),
            insecure_tls: false,
        },
        voice: VoiceConfig {
            duration_secs: 5,
            sample_rate: 44_100,
        },
        tts: TtsConfig {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
        },
    }
}

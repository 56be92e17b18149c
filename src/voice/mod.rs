pub mod recorder;
pub mod wav;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::whisper::Transcriber;
use recorder::AudioRecorder;

/// Produces a spoken query as text. An empty string means no query.
#[async_trait]
pub trait QueryListener: Send + Sync {
    async fn listen_for_query(&self) -> String;
}

pub struct VoiceCapture {
    recorder: Arc<dyn AudioRecorder>,
    transcriber: Option<Arc<dyn Transcriber>>,
    duration: Duration,
    sample_rate: u32,
    device_lock: Mutex<()>,
}

impl VoiceCapture {
    pub fn new(
        recorder: Arc<dyn AudioRecorder>,
        transcriber: Option<Arc<dyn Transcriber>>,
        config: &VoiceConfig,
    ) -> Self {
        Self {
            recorder,
            transcriber,
            duration: Duration::from_secs(config.duration_secs as u64),
            sample_rate: config.sample_rate,
            device_lock: Mutex::new(()),
        }
    }

    pub fn has_transcriber(&self) -> bool {
        self.transcriber.is_some()
    }

    /// Records one clip, transcribes it and returns the trimmed text. The
    /// temporary WAV is removed whether or not transcription succeeds.
    pub async fn listen(&self) -> Result<String, VoiceError> {
        let transcriber = self
            .transcriber
            .as_ref()
            .ok_or(VoiceError::ModelNotLoaded)?;

        let recording = {
            let _device = self.device_lock.lock().await;

            tracing::info!("listening for {:?}", self.duration);
            let recorder = self.recorder.clone();
            let (duration, sample_rate) = (self.duration, self.sample_rate);
            tokio::task::spawn_blocking(move || recorder.record(duration, sample_rate))
                .await
                .map_err(|err| VoiceError::Recording(err.to_string()))??
        };

        let clip = tokio::task::spawn_blocking(move || -> Result<_, VoiceError> {
            let file = tempfile::Builder::new()
                .prefix("voice-query-")
                .suffix(".wav")
                .tempfile()?;
            wav::write_wav(file.path(), &recording.samples, recording.sample_rate)?;
            Ok(file.into_temp_path())
        })
        .await
        .map_err(|err| VoiceError::Recording(err.to_string()))??;

        tracing::info!("transcribing {}", clip.display());
        let transcript = transcriber.transcribe(&clip).await;

        if let Err(err) = clip.close() {
            tracing::warn!("failed to remove temporary audio clip: {}", err);
        }

        let text = transcript.map_err(VoiceError::Transcription)?;
        tracing::info!("user said: {:?}", text);
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl QueryListener for VoiceCapture {
    async fn listen_for_query(&self) -> String {
        match self.listen().await {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!("voice query produced no text: {}", err);
                String::new()
            }
        }
    }
}

use std::time::Duration;

use crate::error::VoiceError;

#[derive(Debug, Clone)]
pub struct Recording {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Blocking audio source. Implementations are called from a blocking
/// worker thread, never from the async runtime.
pub trait AudioRecorder: Send + Sync {
    fn record(&self, duration: Duration, sample_rate: u32) -> Result<Recording, VoiceError>;
}

/// The default input device of the host.
#[derive(Debug, Clone, Default)]
pub struct Microphone;

#[cfg(not(feature = "microphone"))]
impl AudioRecorder for Microphone {
    fn record(&self, _duration: Duration, _sample_rate: u32) -> Result<Recording, VoiceError> {
        Err(VoiceError::AudioUnavailable(
            "built without the `microphone` feature".to_string(),
        ))
    }
}

#[cfg(feature = "microphone")]
impl AudioRecorder for Microphone {
    fn record(&self, duration: Duration, sample_rate: u32) -> Result<Recording, VoiceError> {
        capture::record_default_input(duration, sample_rate)
    }
}

#[cfg(feature = "microphone")]
mod capture {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Sample, SampleFormat, SizedSample, StreamConfig};

    use super::Recording;
    use crate::error::VoiceError;

    pub(super) fn record_default_input(
        duration: Duration,
        sample_rate: u32,
    ) -> Result<Recording, VoiceError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioUnavailable("no default input device".to_string()))?;

        let default_config = device
            .default_input_config()
            .map_err(|err| VoiceError::AudioUnavailable(err.to_string()))?;

        let requested = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let format = default_config.sample_format();
        let buffer = Arc::new(Mutex::new(Vec::new()));

        // Fall back to the device's own layout when it rejects mono at the
        // requested rate; channels are averaged down to mono either way.
        let (stream, config) = match open_stream(&device, &requested, format, buffer.clone()) {
            Ok(stream) => (stream, requested),
            Err(err) => {
                tracing::warn!("input device rejected mono {} Hz: {}", sample_rate, err);
                let fallback: StreamConfig = default_config.config();
                let stream = open_stream(&device, &fallback, format, buffer.clone())?;
                (stream, fallback)
            }
        };

        stream
            .play()
            .map_err(|err| VoiceError::Recording(err.to_string()))?;
        std::thread::sleep(duration);
        drop(stream);

        let interleaved = buffer
            .lock()
            .map_err(|_| VoiceError::Recording("capture buffer poisoned".to_string()))?
            .clone();

        let channels = config.channels.max(1) as usize;
        let mut samples: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        let expected = (duration.as_secs_f64() * config.sample_rate.0 as f64) as usize;
        samples.truncate(expected);

        if samples.is_empty() {
            return Err(VoiceError::Recording("no audio captured".to_string()));
        }

        Ok(Recording {
            samples,
            sample_rate: config.sample_rate.0,
        })
    }

    fn open_stream(
        device: &cpal::Device,
        config: &StreamConfig,
        format: SampleFormat,
        buffer: Arc<Mutex<Vec<f32>>>,
    ) -> Result<cpal::Stream, VoiceError> {
        match format {
            SampleFormat::F32 => build::<f32>(device, config, buffer),
            SampleFormat::I16 => build::<i16>(device, config, buffer),
            SampleFormat::U16 => build::<u16>(device, config, buffer),
            other => Err(VoiceError::AudioUnavailable(format!(
                "unsupported sample format {other:?}"
            ))),
        }
    }

    fn build<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        buffer: Arc<Mutex<Vec<f32>>>,
    ) -> Result<cpal::Stream, VoiceError>
    where
        T: SizedSample,
        f32: cpal::FromSample<T>,
    {
        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut guard) = buffer.lock() {
                        guard.extend(data.iter().map(|s| s.to_sample::<f32>()));
                    }
                },
                |err| tracing::error!("audio input stream error: {}", err),
                None,
            )
            .map_err(|err| VoiceError::Recording(err.to_string()))
    }
}

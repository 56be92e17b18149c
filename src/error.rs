use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("RAG model or vector store not loaded. Check server logs.")]
    NotInitialized,

    #[error("text_query must not be empty")]
    EmptyQuery,

    #[error("Error during search: {0:#}")]
    Internal(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("transcription model not loaded")]
    ModelNotLoaded,

    #[error("audio capture unavailable: {0}")]
    AudioUnavailable(String),

    #[error("error during audio recording: {0}")]
    Recording(String),

    #[error("failed to write audio clip: {0}")]
    Wav(#[from] hound::Error),

    #[error("audio file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error transcribing audio: {0:#}")]
    Transcription(anyhow::Error),
}

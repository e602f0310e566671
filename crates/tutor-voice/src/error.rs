//! Error types for the voice loop

use thiserror::Error;
use tutor_core::CoreError;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Failures from the recognition capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    #[error("recognition timed out")]
    Timeout,

    #[error("recognition network error: {0}")]
    Network(String),

    /// The engine cannot be used at all (credentials, permission, missing model).
    #[error("recognition unavailable: {0}")]
    Unavailable(String),
}

/// Failures from the response generator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generator network error: {0}")]
    Network(String),

    #[error("generator rate limited")]
    RateLimited,

    #[error("generator returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("generator timed out")]
    Timeout,

    /// Rejected credentials or a permanently missing service.
    #[error("generator unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur in the voice loop
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("Recognition error: {0}")]
    Recognition(#[from] RecognitionError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Loop is busy ({0}); try again once the tutor has replied")]
    Busy(&'static str),

    #[error("Session ended: {0}")]
    SessionEnded(String),

    #[error("Session already completed")]
    AlreadyCompleted,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// True when the capability behind this error will not come back on its own.
    /// Fatal errors end the session; everything else is absorbed by the loop.
    pub fn is_fatal(&self) -> bool {
        match self {
            VoiceError::AudioDevice(_) | VoiceError::PermissionDenied => true,
            VoiceError::Recognition(RecognitionError::Unavailable(_)) => true,
            VoiceError::Generation(GenerationError::Unavailable(_)) => true,
            VoiceError::Recognition(_)
            | VoiceError::Generation(_)
            | VoiceError::VadProcessing(_)
            | VoiceError::Synthesis(_)
            | VoiceError::Playback(_) => false,
            VoiceError::Config(_)
            | VoiceError::Busy(_)
            | VoiceError::SessionEnded(_)
            | VoiceError::AlreadyCompleted
            | VoiceError::ChannelClosed(_)
            | VoiceError::Core(_)
            | VoiceError::Io(_) => false,
        }
    }
}

impl From<reqwest::Error> for RecognitionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RecognitionError::Timeout
        } else {
            RecognitionError::Network(err.to_string())
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GenerationError::Timeout
        } else if err.is_decode() {
            GenerationError::MalformedResponse(err.to_string())
        } else {
            GenerationError::Network(err.to_string())
        }
    }
}

#[cfg(feature = "device")]
impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => VoiceError::PermissionDenied,
            other => VoiceError::AudioDevice(other.to_string()),
        }
    }
}

#[cfg(feature = "device")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

use thiserror::Error;

/// Errors produced by the cast protocol layer.
#[derive(Debug, Error)]
pub enum CastError {
    #[error("connect error: {0}")]
    Connect(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("receiver status unavailable after {attempts} attempts")]
    StatusUnavailable { attempts: u32 },

    #[error("media not yet initialised, there is nothing to {0}")]
    MediaNotInitialized(&'static str),

    #[error("application isn't set")]
    ApplicationNotSet,

    #[error("unknown content-type for {0:?}, either specify a content-type or enable transcoding")]
    UnknownContentType(String),

    #[error("specified volume {0} is out of range (0 - 1)")]
    VolumeOutOfRange(f32),

    #[error("device failed to load media")]
    LoadFailed,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transcoder error: {0}")]
    Transcoder(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<prost::DecodeError> for CastError {
    fn from(e: prost::DecodeError) -> Self {
        CastError::InvalidMessage(e.to_string())
    }
}

impl From<prost::EncodeError> for CastError {
    fn from(e: prost::EncodeError) -> Self {
        CastError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CastError {
    fn from(e: serde_json::Error) -> Self {
        CastError::Serialization(e.to_string())
    }
}

pub type CastResult<T> = Result<T, CastError>;

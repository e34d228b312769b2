use thiserror::Error;

use crate::manifest::TrackType;

/// Classification of every failure the engine can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NetworkTransient,
    NetworkOffline,
    Parse,
    BufferAppend,
    BufferFull,
    UnsupportedTrack,
    FatalInternal,
}

impl ErrorKind {
    /// Whether the backoff scheduler may retry an operation failing with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkTransient | Self::NetworkOffline)
    }
}

#[derive(Error, Debug)]
pub enum TsumugiError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("Network error: {0}")]
    NetworkTransient(String),

    #[error("Network unreachable: {0}")]
    NetworkOffline(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Buffer rejected appended data: {0}")]
    BufferAppend(String),

    #[error("Buffer is full")]
    BufferFull,

    #[error("Unsupported {track_type:?} track: {reason}")]
    UnsupportedTrack {
        track_type: TrackType,
        reason: String,
    },

    #[error("Retry budget exhausted after {attempts} attempt(s): {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<TsumugiError>,
    },

    #[error("No period found at position {0}")]
    NoPeriodFound(f64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
}

impl TsumugiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HttpError(status) => classify_status(*status),
            Self::NetworkTransient(_) => ErrorKind::NetworkTransient,
            Self::NetworkOffline(_) => ErrorKind::NetworkOffline,
            Self::Parse(_) | Self::UrlParseError(_) => ErrorKind::Parse,
            Self::BufferAppend(_) => ErrorKind::BufferAppend,
            Self::BufferFull => ErrorKind::BufferFull,
            Self::UnsupportedTrack { .. } => ErrorKind::UnsupportedTrack,
            Self::RequestError(e) => classify_request_error(e),
            Self::RetryExhausted { .. }
            | Self::NoPeriodFound(_)
            | Self::InvalidConfig(_)
            | Self::Internal(_)
            | Self::JoinError(_) => ErrorKind::FatalInternal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Owned copy of this error keeping its kind and message, used to report a
    /// failure that is still being handled elsewhere.
    pub fn detached(&self) -> TsumugiError {
        let message = self.to_string();
        match self.kind() {
            ErrorKind::NetworkTransient => Self::NetworkTransient(message),
            ErrorKind::NetworkOffline => Self::NetworkOffline(message),
            ErrorKind::Parse => Self::Parse(message),
            ErrorKind::BufferAppend => Self::BufferAppend(message),
            ErrorKind::BufferFull => Self::BufferFull,
            ErrorKind::UnsupportedTrack => match self {
                Self::UnsupportedTrack { track_type, reason } => Self::UnsupportedTrack {
                    track_type: *track_type,
                    reason: reason.clone(),
                },
                _ => Self::Internal(message),
            },
            ErrorKind::FatalInternal => Self::Internal(message),
        }
    }
}

fn classify_status(status: reqwest::StatusCode) -> ErrorKind {
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        ErrorKind::NetworkTransient
    } else {
        ErrorKind::FatalInternal
    }
}

fn classify_request_error(error: &reqwest::Error) -> ErrorKind {
    if let Some(status) = error.status() {
        return classify_status(status);
    }
    if error.is_connect() {
        ErrorKind::NetworkOffline
    } else if error.is_timeout() || error.is_request() || error.is_body() {
        ErrorKind::NetworkTransient
    } else if error.is_decode() {
        ErrorKind::Parse
    } else {
        ErrorKind::FatalInternal
    }
}

pub type TsumugiResult<T> = Result<T, TsumugiError>;

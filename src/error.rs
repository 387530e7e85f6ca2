//! Error types for the audio relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error types that can occur while resolving and relaying a resource
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    #[error("Unsatisfiable range: bytes={start}-{end} for resource of {total} bytes")]
    UnsatisfiableRange { start: u64, end: u64, total: u64 },

    #[error("Extraction failed (exit code {exit_code:?}): {message}")]
    ExtractionFailed {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("No audio-only format available for {0}")]
    NoAudioFormat(String),

    #[error("Upstream rejected the request with status {status}")]
    UpstreamForbidden { status: u16 },

    #[error("Upstream returned unexpected status {status}")]
    UpstreamStatus { status: u16 },

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::IoError(err.to_string())
    }
}

impl RelayError {
    /// Create an ExtractionFailed error from an exit code and message
    pub fn extraction_failed(exit_code: Option<i32>, message: impl Into<String>) -> Self {
        RelayError::ExtractionFailed {
            exit_code,
            message: message.into(),
        }
    }

    /// Classify a non-success upstream status code
    ///
    /// 401 and 403 mean the resolved link has expired or was rejected, which is
    /// the only condition the relay recovers from by re-resolving.
    pub fn from_upstream_status(status: u16) -> Self {
        match status {
            401 | 403 => RelayError::UpstreamForbidden { status },
            _ => RelayError::UpstreamStatus { status },
        }
    }

    /// Whether this error should trigger invalidate + re-resolve + retry
    pub fn triggers_reresolve(&self) -> bool {
        matches!(self, RelayError::UpstreamForbidden { .. })
    }

    /// Whether this error came from the resolution step
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            RelayError::ExtractionFailed { .. } | RelayError::NoAudioFormat(_)
        )
    }

    /// Convert error to HTTP status code
    ///
    /// - Malformed identifiers: 400
    /// - Out-of-bounds ranges: 416
    /// - Resolution and upstream failures: 502 Bad Gateway
    /// - Everything else: 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            RelayError::InvalidIdentifier(_) => 400,

            RelayError::InvalidRange(_) => 416,
            RelayError::UnsatisfiableRange { .. } => 416,

            RelayError::ExtractionFailed { .. } => 502,
            RelayError::NoAudioFormat(_) => 502,
            RelayError::UpstreamForbidden { .. } => 502,
            RelayError::UpstreamStatus { .. } => 502,
            RelayError::UpstreamTransport(_) => 502,

            RelayError::ConfigError(_) => 500,
            RelayError::IoError(_) => 500,
            RelayError::InternalError(_) => 500,
        }
    }

    /// Message safe to return to clients
    pub fn client_message(&self) -> &'static str {
        match self {
            RelayError::InvalidIdentifier(_) => "Invalid video ID",
            RelayError::InvalidRange(_) | RelayError::UnsatisfiableRange { .. } => {
                "Range not satisfiable"
            }
            RelayError::ExtractionFailed { .. } | RelayError::NoAudioFormat(_) => {
                "Failed to resolve audio"
            }
            RelayError::UpstreamForbidden { .. }
            | RelayError::UpstreamStatus { .. }
            | RelayError::UpstreamTransport(_) => "Upstream fetch failed",
            RelayError::ConfigError(_) | RelayError::IoError(_) | RelayError::InternalError(_) => {
                "Internal server error"
            }
        }
    }
}

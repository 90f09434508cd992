//! Error types for the gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to connect to or read from an RTSP source
    #[error("Source connection error: {0}")]
    SourceConnection(String),

    /// Failed to decode a media frame
    #[error("Decode error: {0}")]
    Decode(String),

    /// Failed to encode a media frame
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// SDP negotiation failed
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// A negotiation step exceeded its deadline
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Session limit reached
    #[error("Session capacity reached ({0} active)")]
    Capacity(usize),

    /// Session ID not found
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SourceConnection(_) | Error::Decode(_) | Error::Io(_)
        )
    }

    /// Whether the error is a configuration problem
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Negotiation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::SourceConnection("refused".to_string()).is_retryable());
        assert!(Error::Decode("bad frame".to_string()).is_retryable());
        assert!(!Error::Capacity(20).is_retryable());
        assert!(!Error::UnknownSession("abc".to_string()).is_retryable());
    }

    #[test]
    fn test_config_errors() {
        assert!(Error::InvalidConfig("bad".to_string()).is_config_error());
        assert!(!Error::Timeout("answer".to_string()).is_config_error());
    }

    #[test]
    fn test_error_display() {
        let e = Error::Capacity(20);
        assert_eq!(e.to_string(), "Session capacity reached (20 active)");

        let e = Error::Timeout("ICE gathering".to_string());
        assert_eq!(e.to_string(), "Timed out waiting for ICE gathering");
    }
}

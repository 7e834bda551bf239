use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmberError {
    #[error("could not write because of retention settings")]
    Retention,

    #[error("running out of space")]
    OutOfSpace,

    #[error("start time cannot be after end time")]
    InvalidTimeRange,

    #[error("segment tree reached max depth, check start / end time parameters")]
    SegmentDepthLimit,

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Operation canceled")]
    Canceled,
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, EmberError>;

impl EmberError {
    /// Creates a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a new parse error
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Creates a new decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    /// Returns true for conditions a client caused and can correct,
    /// as opposed to internal storage failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Retention | Self::InvalidTimeRange | Self::Parse { .. }
        )
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Retention => "retention",
            Self::OutOfSpace => "capacity",
            Self::InvalidTimeRange | Self::SegmentDepthLimit => "validation",
            Self::Parse { .. } => "parse",
            Self::Decode { .. } => "corruption",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Join(_) => "async",
            Self::ChannelSend => "channel",
            Self::Canceled => "canceled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EmberError::parse("unterminated brace");
        assert_eq!(err.to_string(), "Parse error: unterminated brace");
        assert_eq!(err.category(), "parse");
    }

    #[test]
    fn test_client_errors() {
        assert!(EmberError::Retention.is_client_error());
        assert!(EmberError::parse("x").is_client_error());
        assert!(!EmberError::decode("bad version").is_client_error());
        assert!(!EmberError::OutOfSpace.is_client_error());
    }
}

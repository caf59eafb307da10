use thiserror::Error;

/// Reasons a single frame is refused by a strict aggregator.
///
/// A refused frame never mutates aggregated state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unparsable {field} quantity: {text:?}")]
    NumericParseFailure { field: &'static str, text: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("listener {listener} failed: {source}")]
    ListenerFailed {
        listener: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("a connection is already open in this process")]
    ConnectionAlreadyOpen,
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_error_converts_into_error() {
        let err: Error = FrameError::MalformedFrame("missing sku".to_string()).into();
        assert!(matches!(err, Error::Frame(FrameError::MalformedFrame(_))));
        assert_eq!(err.to_string(), "malformed frame: missing sku");
    }

    #[test]
    fn numeric_failure_names_field_and_text() {
        let err = FrameError::NumericParseFailure {
            field: "reserved-stock",
            text: "x".to_string(),
        };
        assert_eq!(err.to_string(), "unparsable reserved-stock quantity: \"x\"");
    }
}

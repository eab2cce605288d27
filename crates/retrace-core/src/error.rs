use std::io;
use thiserror::Error;

/// Errors raised while building, persisting or loading recordings.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("test name {0:?} contains illegal sequence '../'")]
    InvalidTestName(String),

    #[error("serialized request is malformed: {0}")]
    Malformed(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("response with shaSum {hash} not found in {file}")]
    InteractionNotFound { file: String, hash: String },

    #[error("recording {0} does not exist")]
    RecordingNotFound(String),

    #[error("failed to decode gzip body: {0}")]
    Gzip(#[source] io::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// True when the error means "nothing recorded for this request".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::InteractionNotFound { .. } | Self::RecordingNotFound(_)
        )
    }
}

/// Errors raised while parsing a WebSocket transcript.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("invalid message prefix at position {position}: expected '>' or '<', got {found:?}")]
    InvalidDirection { position: usize, found: char },

    #[error("missing chunk length after prefix at position {0}")]
    MissingLength(usize),

    #[error("invalid chunk length {0:?}")]
    InvalidLength(String),

    #[error("chunk of length {length} at position {position} exceeds transcript bounds")]
    OutOfBounds { position: usize, length: usize },
}

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction run ended with status {status}: {detail}")]
    Failed { status: String, detail: String },

    #[error("extraction did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("extraction cancelled")]
    Cancelled,

    #[error("extraction service error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error talking to extraction service: {0}")]
    Network(String),

    #[error("extraction reply contained no text")]
    EmptyReply,

    #[error("no usable JSON in extraction reply: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ExtractError {
    fn from(err: reqwest::Error) -> Self {
        ExtractError::Network(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encoding list column: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error(transparent)]
    Source(#[from] config::ConfigError),
}

/// Where in the per-document unit of work a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Extract,
    Parse,
    Normalize,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Parse => "parse",
            Stage::Normalize => "normalize",
            Stage::Load => "load",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure scoped to one document. Never aborts the batch.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Extraction(ExtractError),

    #[error("extraction returned no policy_id; needs manual review")]
    MissingPolicyId,

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl From<ExtractError> for DocumentError {
    fn from(err: ExtractError) -> Self {
        DocumentError::Extraction(err)
    }
}

impl DocumentError {
    pub fn stage(&self) -> Stage {
        match self {
            DocumentError::Transport(_) => Stage::Fetch,
            DocumentError::Extraction(ExtractError::Parse(_)) => Stage::Parse,
            DocumentError::Extraction(_) => Stage::Extract,
            DocumentError::MissingPolicyId => Stage::Normalize,
            DocumentError::Load(_) => Stage::Load,
        }
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FrontierError>;

#[derive(Error, Debug)]
pub enum FrontierError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] rocksdb::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid URI '{uri}': {source}")]
    Uri {
        uri: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not in process: {0}")]
    NotInProcess(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Interrupt handler error: {0}")]
    Interrupt(String),

    #[error("Malformed journal line: {0}")]
    Journal(String),
}

impl FrontierError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn uri(uri: impl Into<String>, source: url::ParseError) -> Self {
        Self::Uri { uri: uri.into(), source }
    }
}

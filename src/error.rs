use thiserror::Error;

/// Failure taxonomy for a comparison round.
///
/// Configuration problems are caught before any network call. Transport,
/// content, and parse failures stay confined to the pipeline that produced
/// them and never cancel sibling pipelines. A failed retrieval search aborts
/// the whole submission before fan-out begins.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompareError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transport error: {0}")]
    Transport(String),
    /// The response parsed cleanly but carried no recognizable text.
    #[error("no content found in response")]
    NoContent,
    #[error("response parse error: {0}")]
    ResponseParse(String),
    #[error("retrieval search failed: {0}")]
    Retrieval(String),
}

impl From<reqwest::Error> for CompareError {
    fn from(err: reqwest::Error) -> Self {
        CompareError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for CompareError {
    fn from(err: serde_json::Error) -> Self {
        CompareError::ResponseParse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CompareError>;

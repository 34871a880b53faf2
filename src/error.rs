use std::sync::Arc;

/// Result type used throughout the SDK.
///
/// This is a standard Rust `Result` with the error variant fixed to the SDK's
/// [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the SDK.
///
/// Evaluation itself never surfaces through this type: every evaluation
/// failure mode is encoded as a reason on the returned evaluation instead.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Neither an inline datafile nor a datafile URL was provided.
    #[error("either a datafile or a datafile URL must be provided")]
    MissingDatafileOptions,

    /// The datafile JSON could not be parsed.
    #[error("failed to parse datafile")]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    DatafileParse(#[source] Arc<serde_json::Error>),

    /// The configured datafile URL is not a valid URL.
    #[error("invalid datafile URL")]
    InvalidUrl(#[source] url::ParseError),

    /// Network error while fetching the datafile.
    #[error(transparent)]
    Fetch(Arc<reqwest::Error>),

    /// The datafile endpoint responded with a non-success status.
    #[error("unexpected response status {0} while fetching datafile")]
    FetchStatus(reqwest::StatusCode),

    /// An I/O error.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// Indicates that the refresher thread panicked. This should normally
    /// never happen.
    #[error("refresher thread panicked")]
    RefresherThreadPanicked,
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::DatafileParse(Arc::new(value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Fetch(Arc::new(value.without_url()))
    }
}

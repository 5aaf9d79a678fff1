//! Errors for the tracker HTTP client (C3) and the origin HTTP client (C2,
//! C10). Both speak JSON over HTTP so they share the same error shape.

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("{0}")]
    Json(serde_json::Error),

    #[error("{0}")]
    Http(reqwest::Error),

    #[error("tracker returned 404, torrent unknown")]
    NotFound,

    #[error("tracker announce timed out")]
    Timeout,
}

impl From<serde_json::Error> for TrackerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

pub type OriginResult<T, E = OriginError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("metainfo is still being generated, retry later")]
    MetaInfoPending,

    #[error("origin has no such blob")]
    NotFound,

    #[error("invalid metainfo from origin: {0}")]
    Invalid(String),

    #[error("{0}")]
    Json(serde_json::Error),

    #[error("{0}")]
    Http(reqwest::Error),
}

impl From<serde_json::Error> for OriginError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<reqwest::Error> for OriginError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

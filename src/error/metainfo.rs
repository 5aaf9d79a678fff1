//! Errors for parsing/constructing [`crate::metainfo::Metainfo`].

pub(crate) type Result<T> = std::result::Result<T, MetainfoError>;

#[derive(thiserror::Error, Debug)]
pub enum MetainfoError {
    #[error("{0}")]
    Json(serde_json::Error),

    #[error("invalid metainfo: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for MetainfoError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error)
    }
}

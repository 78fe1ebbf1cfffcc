use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Engine error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("alert {0} not found")]
    NotFound(i64),

    #[error("database error {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to load settings: {0}")]
    Settings(String),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Error::InvalidInput(_))
    }
}

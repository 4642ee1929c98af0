use thiserror::Error;

/// Error surface of a backend operation.
///
/// `Transient` errors are the only ones the retry wrapper in [`crate::retrying`]
/// will retry; everything else is considered fatal for the current operation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("object not found: {0}")]
    NoSuchKey(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("object corrupted or signature invalid: {0}")]
    Corrupted(String),

    #[error("backend io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// §4.1: a fatal class (auth failure, missing object when required,
    /// corrupted signature) surfaces immediately; everything else is retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BackendError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

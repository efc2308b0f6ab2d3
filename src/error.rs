//! Crate-wide error taxonomy.
//!
//! Every failure a retrieval can hit maps to exactly one variant here, and
//! every variant maps to exactly one HTTP status. The backend converts these
//! into the uniform `{"error": message}` envelope; the `Display` strings are
//! therefore user-visible and must stay stable.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The probe succeeded but reported an empty format list.
    #[error("No available formats found")]
    NoFormats,

    /// The requested quality label is neither "mp3" nor `<height>p`.
    #[error("Invalid quality '{0}'")]
    InvalidQuality(String),

    /// The engine failed during probe or download. The underlying engine
    /// message is passed through unredacted.
    #[error("{0}")]
    Extraction(String),

    /// The engine reported success but the expected output file is absent.
    #[error("File not found after extraction.")]
    MissingResult,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine failures all classify as extraction failures; the engine's own
/// message is preserved verbatim for the response envelope.
impl From<crate::engine::EngineError> for Error {
    fn from(err: crate::engine::EngineError) -> Self {
        Error::Extraction(err.to_string())
    }
}

impl Error {
    /// HTTP status the backend should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NoFormats => 404,
            Error::InvalidQuality(_) => 400,
            Error::Extraction(_) => 500,
            Error::MissingResult => 500,
            Error::Io(_) => 500,
        }
    }
}

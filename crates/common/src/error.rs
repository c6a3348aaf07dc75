//! Error types for uiproxy

use thiserror::Error;

/// Result type alias using the uiproxy Error
pub type Result<T> = std::result::Result<T, Error>;

/// uiproxy error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid stored value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Failure to turn a raw credential into a principal.
///
/// The variants are only for logging; callers collapse all of them into a
/// single "unauthenticated" outcome.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("credential is malformed or has an invalid signature: {0}")]
    Invalid(String),

    #[error("credential has expired")]
    Expired,

    #[error("credential does not name a subject")]
    MissingSubject,

    #[error("no identity {0} is known")]
    UnknownIdentity(String),

    #[error("identity lookup failed: {0}")]
    Lookup(#[from] Error),
}

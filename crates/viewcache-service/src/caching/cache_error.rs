use std::io;

use thiserror::Error;

/// An error that happens when producing an image for a key.
///
/// The error is [`Clone`] so that a single failed load can be handed to every caller that was
/// coalesced onto it. Errors are never stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The file does not exist.
    #[error("not found")]
    NotFound,
    /// The file was read, but its contents could not be decoded.
    ///
    /// The attached string contains the decoder's message.
    #[error("failed to decode image: {0}")]
    DecodeFailure(String),
    /// The quick loader has no thumbnail source for this file.
    ///
    /// This is not fatal for a race, the quick loader just loses it.
    #[error("no thumbnail available")]
    ThumbnailUnavailable,
    /// A full cache had no record to evict.
    ///
    /// This signals a bug in the cache bookkeeping and is not expected to ever happen.
    #[error("cache capacity invariant violated")]
    CapacityInvariantViolation,
    /// An unexpected error in the cache itself, like a panicking loader.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for LoadError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::from_std_error(err),
        }
    }
}

impl From<image::ImageError> for LoadError {
    #[track_caller]
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(e) => e.into(),
            other => Self::DecodeFailure(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for LoadError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        Self::from_std_error(err)
    }
}

impl LoadError {
    /// A short name usable as a metrics tag.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::DecodeFailure(_) => "decode",
            Self::ThumbnailUnavailable => "nothumbnail",
            Self::CapacityInvariantViolation => "capacity",
            Self::InternalError => "internal",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The outcome of a load, either the loaded value or the reason why it could not be produced.
pub type LoadResult<T> = Result<T, LoadError>;

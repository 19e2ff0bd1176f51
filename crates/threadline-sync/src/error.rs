//! Error type for `threadline-sync`.

use thiserror::Error;

use crate::source::SourceError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  /// Credentials or network; aborts the current source only.
  #[error("source unavailable: {0}")]
  SourceUnavailable(#[source] SourceError),

  /// Retries exhausted against a rate-limited API.
  #[error("rate limited: {0}")]
  RateLimited(#[source] SourceError),

  /// The datastore rejected a write or read; halts the run.
  #[error("storage failure: {0}")]
  Storage(#[source] BoxError),

  #[error("contact registry error: {0}")]
  Contacts(#[source] BoxError),

  #[error("attachment io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("cancelled")]
  Cancelled,
}

impl Error {
  pub fn storage(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Storage(Box::new(e))
  }
}

impl From<SourceError> for Error {
  fn from(e: SourceError) -> Self {
    match e {
      SourceError::Cancelled => Self::Cancelled,
      SourceError::RateLimited { .. } => Self::RateLimited(e),
      other => Self::SourceUnavailable(other),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

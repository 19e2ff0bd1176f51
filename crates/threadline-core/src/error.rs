//! Error types for `threadline-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("unknown source kind: {0:?}")]
  UnknownSource(String),

  #[error("unknown channel: {0:?}")]
  UnknownChannel(String),

  #[error("unknown direction: {0:?}")]
  UnknownDirection(String),

  #[error("unknown link source: {0:?}")]
  UnknownLinkSource(String),

  #[error("malformed link target: {0:?}")]
  MalformedLinkTarget(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

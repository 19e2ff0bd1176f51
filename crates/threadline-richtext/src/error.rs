//! Stage-local decoding failures. None of these escape [`crate::extract`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseFailure {
  #[error("property list error: {0}")]
  Plist(#[from] plist::Error),

  #[error("not a keyed archive")]
  NotKeyedArchive,

  #[error("no known string preamble")]
  NoPreamble,

  #[error("length prefix runs past the end of the blob")]
  Truncated,

  #[error("string payload is not valid utf-8: {0}")]
  InvalidUtf8(#[from] std::str::Utf8Error),

  #[error("no substantive text")]
  NoText,
}

pub type Result<T, E = ParseFailure> = std::result::Result<T, E>;

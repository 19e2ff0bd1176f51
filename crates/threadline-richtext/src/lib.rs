//! Plain-text recovery for message bodies.
//!
//! Message stores keep the visible text either in a plain column or inside a
//! binary rich-text blob, and the blob encoding varies with the OS version
//! that wrote it. [`extract`] tries each known encoding in a fixed order and
//! never fails: the worst case is an empty string.
//!
//! ```
//! use threadline_richtext::{Stage, extract};
//!
//! let out = extract("rec-1", Some("see you at 6"), None);
//! assert_eq!(out.text, "see you at 6");
//! assert_eq!(out.stage, Stage::PlainText);
//! ```

mod archive;
pub mod error;
mod metadata;
mod runs;
mod typedstream;

use std::fmt;

pub use error::{ParseFailure, Result};

// ─── Public types ────────────────────────────────────────────────────────────

/// Which step of the fallback chain produced the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
  PlainText,
  KeyedArchive,
  TypedStream,
  PrintableRuns,
  Empty,
}

impl Stage {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::PlainText => "plain_text",
      Self::KeyedArchive => "keyed_archive",
      Self::TypedStream => "typed_stream",
      Self::PrintableRuns => "printable_runs",
      Self::Empty => "empty",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
  pub text:  String,
  pub stage: Stage,
}

impl Extraction {
  fn new(text: impl Into<String>, stage: Stage) -> Self {
    Self { text: text.into(), stage }
  }

  pub fn is_empty(&self) -> bool { self.stage == Stage::Empty }
}

// ─── Public API ──────────────────────────────────────────────────────────────

/// Recover the display text of one record.
///
/// `plain_text` wins whenever it has any non-whitespace content and is
/// returned verbatim. Otherwise `blob` is tried as a keyed archive, then as a
/// typed stream, then scanned for printable runs. Identical input always
/// yields identical output.
pub fn extract(record_id: &str, plain_text: Option<&str>, blob: Option<&[u8]>) -> Extraction {
  if let Some(text) = plain_text.filter(|t| !t.trim().is_empty()) {
    tracing::trace!(record_id, stage = %Stage::PlainText, "body text extracted");
    return Extraction::new(text, Stage::PlainText);
  }

  let Some(blob) = blob.filter(|b| !b.is_empty()) else {
    tracing::debug!(record_id, "record has neither body text nor rich-text blob");
    return Extraction::new(String::new(), Stage::Empty);
  };

  let stages: [(Stage, fn(&[u8]) -> Result<String>); 3] = [
    (Stage::KeyedArchive, archive::decode),
    (Stage::TypedStream, typedstream::decode),
    (Stage::PrintableRuns, runs::decode),
  ];

  for (stage, decode) in stages {
    match decode(blob) {
      Ok(text) => {
        tracing::debug!(record_id, %stage, chars = text.chars().count(), "body text extracted");
        return Extraction::new(text, stage);
      }
      Err(error) => {
        tracing::trace!(record_id, %stage, %error, "extraction stage fell through");
      }
    }
  }

  tracing::debug!(record_id, bytes = blob.len(), "no text recoverable from rich-text blob");
  Extraction::new(String::new(), Stage::Empty)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_text_is_returned_verbatim() {
    let out = extract("r", Some("  hi there \n"), Some(b"ignored"));
    assert_eq!(out.text, "  hi there \n");
    assert_eq!(out.stage, Stage::PlainText);
  }

  #[test]
  fn blank_plain_text_falls_through_to_blob() {
    let blob = b"\x04\x0bstreamtypedNSString\x01\x94\x84\x01+\x05hello\x86";
    let out = extract("r", Some("   "), Some(blob));
    assert_eq!(out.text, "hello");
    assert_eq!(out.stage, Stage::TypedStream);
  }

  #[test]
  fn nothing_to_work_with_is_empty() {
    let out = extract("r", None, None);
    assert!(out.is_empty());
    assert_eq!(out.text, "");

    let out = extract("r", Some(""), Some(&[]));
    assert!(out.is_empty());
  }

  #[test]
  fn garbage_blob_is_empty_not_an_error() {
    let out = extract("r", None, Some(&[0x00, 0x01, 0x02, 0x84, 0x01]));
    assert_eq!(out.stage, Stage::Empty);
    assert_eq!(out.text, "");
  }

  #[test]
  fn extraction_is_deterministic() {
    let blob = b"\x00\x01Meeting moved\x02\x03to Thursday\x04ok";
    let a = extract("r", None, Some(blob));
    let b = extract("r", None, Some(blob));
    assert_eq!(a, b);
    assert_eq!(a.stage, Stage::PrintableRuns);
    assert_eq!(a.text, "Meeting moved to Thursday");
  }
}

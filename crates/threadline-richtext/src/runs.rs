//! Last-resort scan for human-readable runs inside an unknown blob.

use std::sync::OnceLock;

use regex::Regex;

use crate::{
  error::{ParseFailure, Result},
  metadata::is_metadata,
};

/// Runs shorter than this (in characters) are treated as noise.
const MIN_RUN_CHARS: usize = 3;

/// Stands in for bytes that can't be part of a run.
const BREAK: char = '\u{0}';

// Printable ASCII, Latin-1, Hiragana, Katakana, CJK unified, Hangul, fullwidth forms.
fn re_printable_run() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(
      r"[\x20-\x7E\u{A0}-\u{FF}\u{3040}-\u{309F}\u{30A0}-\u{30FF}\u{4E00}-\u{9FFF}\u{AC00}-\u{D7AF}\u{FF00}-\u{FFEF}]+",
    )
    .expect("printable run pattern is valid")
  })
}

pub fn decode(blob: &[u8]) -> Result<String> {
  let decoded = lossless_decode(blob);
  let runs: Vec<&str> = re_printable_run()
    .find_iter(&decoded)
    .map(|m| m.as_str().trim())
    .filter(|run| run.chars().count() >= MIN_RUN_CHARS && !is_metadata(run))
    .collect();

  if runs.is_empty() {
    return Err(ParseFailure::NoText);
  }
  Ok(runs.join(" "))
}

/// Decode valid UTF-8 sequences exactly; read stray bytes in `0xA0..=0xFF` as
/// Latin-1 and turn anything else into a run break.
fn lossless_decode(blob: &[u8]) -> String {
  let mut out = String::with_capacity(blob.len());
  for chunk in blob.utf8_chunks() {
    out.push_str(chunk.valid());
    for &b in chunk.invalid() {
      out.push(if b >= 0xA0 { char::from(b) } else { BREAK });
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn joins_runs_and_drops_short_noise() {
    let blob = b"\x01\x02Call me\x03\x04ok\x05when free\x06";
    assert_eq!(decode(blob).unwrap(), "Call me when free");
  }

  #[test]
  fn cjk_survives_intact() {
    let mut blob = vec![0x00, 0x11];
    blob.extend_from_slice("今日は会議です".as_bytes());
    blob.extend_from_slice(&[0x12, 0x00]);
    blob.extend_from_slice("회의 시작".as_bytes());
    assert_eq!(decode(&blob).unwrap(), "今日は会議です 회의 시작");
  }

  #[test]
  fn stray_latin1_bytes_are_mapped() {
    // "café" written as Latin-1 rather than UTF-8.
    let blob = b"\x02caf\xe9 au lait\x03";
    assert_eq!(decode(blob).unwrap(), "café au lait");
  }

  #[test]
  fn metadata_runs_are_dropped() {
    let blob = b"\x04\x0bstreamtyped\x81\xe8\x03\x84\x01@\x84\x84\x84\x12NSAttributedString\x00\x84\x84NSObject\x00";
    assert!(matches!(decode(blob), Err(ParseFailure::NoText)));
  }

  #[test]
  fn nothing_printable() {
    assert!(matches!(decode(&[0x00, 0x01, 0x02, 0x90]), Err(ParseFailure::NoText)));
  }
}

//! Legacy `streamtyped` archive decoding.
//!
//! The string payload follows a class-name preamble and is prefixed by its
//! byte length: one byte below `0x80`, or `0x81` + u16 LE, or `0x82` + u32 LE.
//! Different string subclasses and archive versions write different
//! preambles, so several are recognised.

use crate::error::{ParseFailure, Result};

const PREAMBLES: &[&[u8]] = &[
  b"NSString\x01\x94\x84\x01+",
  b"NSString\x01\x95\x84\x01+",
  b"NSMutableString\x01\x94\x84\x01+",
  b"NSMutableString\x01\x95\x84\x01+",
];

/// Ends every string preamble; preceded by one or two version bytes.
const MARKER: &[u8] = b"\x84\x01+";

/// How far past a generic `NS…String` class name the marker may start.
const MARKER_WINDOW: usize = 4;

pub fn decode(blob: &[u8]) -> Result<String> {
  let start = payload_offset(blob).ok_or(ParseFailure::NoPreamble)?;
  let (len, rest) = read_length(&blob[start..])?;
  let bytes = rest.get(..len).ok_or(ParseFailure::Truncated)?;
  let text = std::str::from_utf8(bytes)?;
  if text.trim().is_empty() {
    return Err(ParseFailure::NoText);
  }
  Ok(text.to_owned())
}

fn payload_offset(blob: &[u8]) -> Option<usize> {
  PREAMBLES
    .iter()
    .find_map(|p| find(blob, p).map(|i| i + p.len()))
    .or_else(|| generic_offset(blob))
}

/// Any `NS…String` class name followed closely by the marker.
fn generic_offset(blob: &[u8]) -> Option<usize> {
  const SUFFIX: &[u8] = b"String";
  let mut from = 0;
  while let Some(rel) = find(&blob[from..], SUFFIX) {
    let name_end = from + rel + SUFFIX.len();
    let name_start = blob[..from + rel]
      .iter()
      .rposition(|b| !b.is_ascii_alphanumeric())
      .map_or(0, |i| i + 1);

    if blob[name_start..].starts_with(b"NS") {
      let window_end = (name_end + MARKER_WINDOW + MARKER.len()).min(blob.len());
      if let Some(m) = find(&blob[name_end..window_end], MARKER) {
        return Some(name_end + m + MARKER.len());
      }
    }
    from = name_end;
  }
  None
}

fn read_length(buf: &[u8]) -> Result<(usize, &[u8])> {
  match buf.first().copied() {
    Some(0x81) => {
      let b = buf.get(1..3).ok_or(ParseFailure::Truncated)?;
      Ok((u16::from_le_bytes([b[0], b[1]]) as usize, &buf[3..]))
    }
    Some(0x82) => {
      let b = buf.get(1..5).ok_or(ParseFailure::Truncated)?;
      Ok((u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize, &buf[5..]))
    }
    Some(n) if n < 0x80 => Ok((n as usize, &buf[1..])),
    _ => Err(ParseFailure::Truncated),
  }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn stream(preamble: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = b"\x04\x0bstreamtyped\x81\xe8\x03\x84\x01@\x84\x84\x84".to_vec();
    out.extend_from_slice(preamble);
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\x86\x84\x02iI\x01");
    out
  }

  #[test]
  fn every_known_preamble_decodes() {
    for preamble in PREAMBLES {
      let mut payload = vec![5u8];
      payload.extend_from_slice(b"hello");
      assert_eq!(decode(&stream(preamble, &payload)).unwrap(), "hello", "{preamble:?}");
    }
  }

  #[test]
  fn generic_string_subclass_decodes() {
    let blob = stream(b"NSTaggedString\x01\x84\x01+", b"\x03hey");
    assert_eq!(decode(&blob).unwrap(), "hey");
  }

  #[test]
  fn two_byte_length_prefix() {
    let text = "x".repeat(300);
    let mut payload = vec![0x81, 0x2c, 0x01];
    payload.extend_from_slice(text.as_bytes());
    assert_eq!(decode(&stream(PREAMBLES[0], &payload)).unwrap(), text);
  }

  #[test]
  fn four_byte_length_prefix() {
    let text = "y".repeat(70_000);
    let mut payload = vec![0x82];
    payload.extend_from_slice(&70_000u32.to_le_bytes());
    payload.extend_from_slice(text.as_bytes());
    assert_eq!(decode(&stream(PREAMBLES[1], &payload)).unwrap(), text);

    // A u32 length that runs past the end of the blob.
    assert!(matches!(
      decode(&stream(PREAMBLES[1], &[0x82, 0x01, 0x00])),
      Err(ParseFailure::Truncated)
    ));
  }

  #[test]
  fn multibyte_text_is_preserved() {
    let text = "Café ☕ 你好";
    let mut payload = vec![text.len() as u8];
    payload.extend_from_slice(text.as_bytes());
    assert_eq!(decode(&stream(PREAMBLES[2], &payload)).unwrap(), text);
  }

  #[test]
  fn invalid_utf8_is_rejected() {
    let blob = stream(PREAMBLES[0], b"\x03a\xffb");
    assert!(matches!(decode(&blob), Err(ParseFailure::InvalidUtf8(_))));
  }

  #[test]
  fn overlong_length_is_truncated() {
    let blob = stream(PREAMBLES[0], b"\x7fshort");
    // The trailer bytes make the stream longer than the payload, but not 127.
    assert!(matches!(decode(&blob), Err(ParseFailure::Truncated)));
  }

  #[test]
  fn missing_preamble() {
    assert!(matches!(decode(b"plain bytes"), Err(ParseFailure::NoPreamble)));
  }
}

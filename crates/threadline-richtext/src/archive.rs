//! Keyed-archive (`NSKeyedArchiver` property list) decoding.
//!
//! The archive is a flat `$objects` array where containers point at their
//! members with UIDs. The message text is the first substantive string that
//! is either a top-level object or the `NS.string`/`NSString` member of a
//! string-like container.

use std::io::Cursor;

use plist::Value;

use crate::{
  error::{ParseFailure, Result},
  metadata::is_metadata,
};

const STRING_KEYS: &[&str] = &["NS.string", "NSString"];

pub fn decode(blob: &[u8]) -> Result<String> {
  let value = Value::from_reader(Cursor::new(blob))?;
  let objects = value
    .as_dictionary()
    .and_then(|d| d.get("$objects"))
    .and_then(Value::as_array)
    .ok_or(ParseFailure::NotKeyedArchive)?;

  objects
    .iter()
    .find_map(|obj| candidate(obj, objects))
    .ok_or(ParseFailure::NoText)
}

fn candidate(obj: &Value, objects: &[Value]) -> Option<String> {
  match obj {
    Value::String(s) => substantive(s),
    Value::Dictionary(dict) => STRING_KEYS
      .iter()
      .filter_map(|k| dict.get(k))
      .find_map(|member| match member {
        Value::String(s) => substantive(s),
        Value::Uid(uid) => usize::try_from(uid.get())
          .ok()
          .and_then(|i| objects.get(i))
          .and_then(Value::as_string)
          .and_then(substantive),
        _ => None,
      }),
    _ => None,
  }
}

fn substantive(s: &str) -> Option<String> {
  if s.trim().is_empty() || is_metadata(s) {
    return None;
  }
  Some(s.to_owned())
}

#[cfg(test)]
mod tests {
  use plist::{Dictionary, Uid};

  use super::*;

  fn archive(objects: Vec<Value>) -> Vec<u8> {
    let mut root = Dictionary::new();
    root.insert("$archiver".into(), Value::String("NSKeyedArchiver".into()));
    root.insert("$version".into(), Value::Integer(100_000i64.into()));
    root.insert("$objects".into(), Value::Array(objects));
    let mut out = Vec::new();
    Value::Dictionary(root).to_writer_binary(&mut out).unwrap();
    out
  }

  fn dict(pairs: &[(&str, Value)]) -> Value {
    let mut d = Dictionary::new();
    for (k, v) in pairs {
      d.insert((*k).into(), v.clone());
    }
    Value::Dictionary(d)
  }

  #[test]
  fn resolves_string_through_uid() {
    let blob = archive(vec![
      Value::String("$null".into()),
      dict(&[("NSString", Value::Uid(Uid::new(2))), ("$class", Value::Uid(Uid::new(3)))]),
      Value::String("Dinner at 7? 🍝".into()),
      dict(&[("$classname", Value::String("NSAttributedString".into()))]),
    ]);
    assert_eq!(decode(&blob).unwrap(), "Dinner at 7? 🍝");
  }

  #[test]
  fn skips_class_names_and_attribute_keys() {
    let blob = archive(vec![
      Value::String("$null".into()),
      Value::String("__kIMMessagePartAttributeName".into()),
      Value::String("NSMutableString".into()),
      dict(&[("NS.string", Value::String("日本語のメッセージ".into()))]),
    ]);
    assert_eq!(decode(&blob).unwrap(), "日本語のメッセージ");
  }

  #[test]
  fn archive_without_text_is_no_text() {
    let blob = archive(vec![Value::String("$null".into()), Value::String("NSDictionary".into())]);
    assert!(matches!(decode(&blob), Err(ParseFailure::NoText)));
  }

  #[test]
  fn non_archive_plist_is_rejected() {
    let mut out = Vec::new();
    Value::Array(vec![Value::String("hello".into())])
      .to_writer_binary(&mut out)
      .unwrap();
    assert!(matches!(decode(&out), Err(ParseFailure::NotKeyedArchive)));
  }

  #[test]
  fn random_bytes_are_a_plist_error() {
    assert!(matches!(decode(b"\x01\x02\x03"), Err(ParseFailure::Plist(_))));
  }
}

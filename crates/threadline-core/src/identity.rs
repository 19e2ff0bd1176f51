//! Participant identity normalization.
//!
//! Every phone number and email handle that enters the system passes through
//! [`normalize_phone`]. The email guard runs before any character stripping:
//! an `@`-bearing handle is only ever case-folded.
//!
//! Missing input, or input that normalizes to nothing, is "no value"
//! ([`normalize_phone_opt`]); callers never match on an empty string.

use std::collections::BTreeSet;

/// Number of trailing digits kept for country-code-agnostic matching.
pub const PHONE_SUFFIX_DIGITS: usize = 10;

/// Canonicalize a phone number or email handle.
///
/// - Contains `@`: returned lowercased, otherwise untouched.
/// - Otherwise: all non-digits are stripped. With at least
///   [`PHONE_SUFFIX_DIGITS`] digits the last ten are returned; shorter digit
///   strings (short codes, extensions) are returned as-is.
pub fn normalize_phone(value: &str) -> String {
  if value.contains('@') {
    return value.to_lowercase();
  }

  let digits: String = value.chars().filter(char::is_ascii_digit).collect();
  if digits.len() >= PHONE_SUFFIX_DIGITS {
    digits[digits.len() - PHONE_SUFFIX_DIGITS..].to_owned()
  } else {
    digits
  }
}

/// Null-preserving variant: `None` for missing input or for input that
/// normalizes to nothing (e.g. a display name without digits).
pub fn normalize_phone_opt(value: Option<&str>) -> Option<String> {
  value.map(normalize_phone).filter(|n| !n.is_empty())
}

/// Normalize a collection of identifiers into a sorted, deduplicated set,
/// dropping anything that normalizes to the empty string.
pub fn normalize_all<'a, I>(values: I) -> BTreeSet<String>
where
  I: IntoIterator<Item = &'a str>,
{
  values
    .into_iter()
    .filter_map(|v| normalize_phone_opt(Some(v)))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn email_is_only_case_folded() {
    assert_eq!(normalize_phone("User@ICLOUD.com"), "user@icloud.com");
    assert_eq!(
      normalize_phone("first.last+tag@Example.ORG"),
      "first.last+tag@example.org"
    );
  }

  #[test]
  fn email_with_digits_keeps_every_character() {
    // A bare digit strip would turn this into "4155550100".
    assert_eq!(normalize_phone("415-555-0100@Carrier.net"), "415-555-0100@carrier.net");
  }

  #[test]
  fn formatted_us_number_reduces_to_ten_digits() {
    assert_eq!(normalize_phone("+1 (415) 555-0100"), "4155550100");
    assert_eq!(normalize_phone("415.555.0100"), "4155550100");
  }

  #[test]
  fn long_numbers_keep_last_ten_digits() {
    assert_eq!(normalize_phone("+44 20 7946 0958 12"), "7946095812");
    assert_eq!(normalize_phone("0044 7700 900123"), "7700900123");
  }

  #[test]
  fn short_numbers_are_not_padded() {
    assert_eq!(normalize_phone("12345"), "12345");
    assert_eq!(normalize_phone("ext. 42"), "42");
    assert_eq!(normalize_phone(""), "");
  }

  #[test]
  fn suffix_depends_only_on_last_ten_digits() {
    let variants = ["+1 415 555 0100", "001-415-555-0100", "99 4155550100", "4155550100"];
    for v in variants {
      assert_eq!(normalize_phone(v), "4155550100", "input {v:?}");
    }
  }

  #[test]
  fn missing_or_digitless_input_is_no_value() {
    assert_eq!(normalize_phone_opt(None), None);
    assert_eq!(normalize_phone_opt(Some("no digits here")), None);
    assert_eq!(normalize_phone_opt(Some("A@B.c")), Some("a@b.c".into()));
  }

  #[test]
  fn normalize_all_dedups_and_sorts() {
    let set = normalize_all(["+1 415 555 0100", "4155550100", "Bob@Example.com", "nobody"]);
    let got: Vec<_> = set.into_iter().collect();
    assert_eq!(got, vec!["4155550100".to_string(), "bob@example.com".to_string()]);
  }
}

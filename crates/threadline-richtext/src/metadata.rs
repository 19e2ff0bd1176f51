//! Strings that are archive plumbing rather than message text.

const CLASS_NAMES: &[&str] = &[
  "NSString",
  "NSMutableString",
  "NSAttributedString",
  "NSMutableAttributedString",
  "NSDictionary",
  "NSMutableDictionary",
  "NSObject",
  "NSNumber",
  "NSValue",
  "NSArray",
  "NSMutableArray",
  "NSData",
  "NSMutableData",
  "NSURL",
  "NSColor",
  "NSFont",
  "NSParagraphStyle",
  "NSKeyedArchiver",
  "NSDate",
];

const TOKENS: &[&str] = &["streamtyped", "bplist00", "NS.string", "NS.objects", "NS.keys"];

/// True for class names, archive keys, and attribute names.
pub fn is_metadata(s: &str) -> bool {
  let s = s.trim();
  s == "$null"
    || s.starts_with('$')
    || s.starts_with("__kIM")
    || CLASS_NAMES.contains(&s)
    || TOKENS.iter().any(|t| s.contains(t))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plumbing_is_recognised() {
    assert!(is_metadata("$null"));
    assert!(is_metadata("$classname"));
    assert!(is_metadata("NSMutableAttributedString"));
    assert!(is_metadata("__kIMMessagePartAttributeName"));
    assert!(is_metadata(" streamtyped"));
  }

  #[test]
  fn message_text_is_not_metadata() {
    assert!(!is_metadata("NSString is a class, lunch is at noon"));
    assert!(!is_metadata("Running late"));
  }
}

//! Thread identity and group classification.
//!
//! This is the only implementation of thread grouping. The SQLite store calls
//! [`participants_flat`] when it refreshes a thread inside a chunk commit, the
//! sync engine calls [`thread_key`] for every record, and matching parses the
//! flat string back with [`parse_participants_flat`]. Threads themselves are
//! never authoritative state; [`Thread::from_communications`] recomputes one
//! from its communications.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
  communication::NormalizedCommunication,
  identity::normalize_all,
  record::RawRecord,
};

/// Separator used in `participants_flat`.
pub const FLAT_SEPARATOR: char = ',';

/// Hex characters of the participant digest kept in a derived thread key.
const SIGNATURE_LEN: usize = 16;

// ─── Participants ────────────────────────────────────────────────────────────

/// The sorted, deduplicated, normalized parties of a single record: the
/// sender plus every recipient the source reported.
pub fn participant_set(record: &RawRecord) -> BTreeSet<String> {
  normalize_all(
    record
      .sender
      .iter()
      .chain(record.recipients.iter())
      .map(String::as_str),
  )
}

/// Canonical, order-stable joined form of a participant set.
pub fn participants_flat(set: &BTreeSet<String>) -> String {
  let mut flat = String::new();
  for (i, id) in set.iter().enumerate() {
    if i > 0 {
      flat.push(FLAT_SEPARATOR);
    }
    flat.push_str(id);
  }
  flat
}

/// Inverse of [`participants_flat`].
pub fn parse_participants_flat(flat: &str) -> BTreeSet<String> {
  flat
    .split(FLAT_SEPARATOR)
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(str::to_owned)
    .collect()
}

/// Union of the participants of every communication in a thread.
pub fn thread_participants<'a, I>(communications: I) -> BTreeSet<String>
where
  I: IntoIterator<Item = &'a [String]>,
{
  communications
    .into_iter()
    .flat_map(|ps| ps.iter().cloned())
    .collect()
}

/// A thread is a group chat when it has more than two distinct participants.
pub fn is_group(set: &BTreeSet<String>) -> bool { set.len() > 2 }

// ─── Keys ────────────────────────────────────────────────────────────────────

/// Compute the thread key for a record.
///
/// 1. Source conversation id → `"{source}-chat-{id}"`.
/// 2. Resolvable participants → `"{source}-p-{digest}"`, a digest of the
///    flat participant string, so records between the same parties group even
///    without a source id.
/// 3. Nothing to go on → `"{source}-single-{external_id}"`; anonymous records
///    never share a thread.
pub fn thread_key(record: &RawRecord) -> String {
  let source = record.source.as_str();

  if let Some(id) = record.conversation_id() {
    return format!("{source}-chat-{id}");
  }

  let participants = participant_set(record);
  if !participants.is_empty() {
    return format!("{source}-p-{}", participant_signature(&participants));
  }

  format!("{source}-single-{}", record.external_id)
}

/// Truncated SHA-256 hex digest of the flat participant string.
pub fn participant_signature(set: &BTreeSet<String>) -> String {
  let digest = Sha256::digest(participants_flat(set).as_bytes());
  let mut sig = hex::encode(digest);
  sig.truncate(SIGNATURE_LEN);
  sig
}

// ─── Thread ──────────────────────────────────────────────────────────────────

/// A computed view over the communications sharing a thread key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
  pub thread_key:      String,
  pub participant_set: BTreeSet<String>,
  pub is_group:        bool,
  pub message_count:   usize,
  pub last_activity:   Option<DateTime<Utc>>,
}

impl Thread {
  pub fn from_communications(
    thread_key: impl Into<String>,
    communications: &[NormalizedCommunication],
  ) -> Self {
    let participant_set = thread_participants(
      communications.iter().map(|c| c.participants.as_slice()),
    );
    Self {
      thread_key: thread_key.into(),
      is_group: is_group(&participant_set),
      participant_set,
      message_count: communications.len(),
      last_activity: communications.iter().map(|c| c.sent_at).max(),
    }
  }

  pub fn participants_flat(&self) -> String { participants_flat(&self.participant_set) }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use uuid::Uuid;

  use super::*;
  use crate::record::{Channel, Direction, SourceKind};

  fn record(external_id: &str, sender: Option<&str>, recipients: &[&str]) -> RawRecord {
    let mut r = RawRecord::new(
      SourceKind::Messages,
      external_id,
      Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    );
    r.sender = sender.map(str::to_owned);
    r.recipients = recipients.iter().map(|s| (*s).to_owned()).collect();
    r
  }

  fn comm(participants: &[&str], secs: i64) -> NormalizedCommunication {
    let at = Utc.timestamp_opt(secs, 0).unwrap();
    NormalizedCommunication {
      id:                Uuid::new_v4(),
      user_id:           "u".into(),
      channel:           Channel::Sms,
      direction:         Direction::Inbound,
      participants:      participants.iter().map(|s| (*s).to_owned()).collect(),
      participants_flat: String::new(),
      thread_id:         "t".into(),
      subject:           None,
      body_text:         String::new(),
      sent_at:           at,
      source:            SourceKind::Messages,
      external_id:       Uuid::new_v4().to_string(),
      created_at:        at,
      updated_at:        at,
    }
  }

  #[test]
  fn source_conversation_id_is_namespaced() {
    let mut r = record("m1", Some("+14155550100"), &[]);
    r.conversation_id = Some("chat123".into());
    assert_eq!(thread_key(&r), "messages-chat-chat123");
  }

  #[test]
  fn same_parties_share_a_key_regardless_of_order_or_format() {
    let a = record("m1", Some("+1 (415) 555-0100"), &["Bob@Example.com", "carol@example.com"]);
    let b = record("m2", Some("carol@example.com"), &["bob@example.com", "4155550100"]);
    assert_eq!(thread_key(&a), thread_key(&b));
    assert!(thread_key(&a).starts_with("messages-p-"));
  }

  #[test]
  fn different_parties_get_different_keys() {
    let a = record("m1", Some("a@example.com"), &["b@example.com"]);
    let b = record("m2", Some("a@example.com"), &["c@example.com"]);
    assert_ne!(thread_key(&a), thread_key(&b));
  }

  #[test]
  fn anonymous_records_are_singletons() {
    let a = record("m1", None, &[]);
    let b = record("m2", Some("Unknown Caller"), &[]);
    assert_eq!(thread_key(&a), "messages-single-m1");
    assert_eq!(thread_key(&b), "messages-single-m2");
  }

  #[test]
  fn three_participants_form_a_group() {
    let r = record("m1", Some("a@example.com"), &["b@example.com", "c@example.com"]);
    let set = participant_set(&r);
    assert!(is_group(&set));
    assert_eq!(participants_flat(&set), "a@example.com,b@example.com,c@example.com");
  }

  #[test]
  fn two_participants_are_not_a_group() {
    let r = record("m1", Some("a@example.com"), &["B@example.com", "b@example.com"]);
    assert!(!is_group(&participant_set(&r)));
  }

  #[test]
  fn flat_string_parses_back() {
    let r = record("m1", Some("4155550100"), &["z@example.com", "a@example.com"]);
    let set = participant_set(&r);
    assert_eq!(parse_participants_flat(&participants_flat(&set)), set);
    assert!(parse_participants_flat("").is_empty());
  }

  #[test]
  fn thread_is_union_of_all_communications() {
    let comms = vec![
      comm(&["a@example.com", "b@example.com"], 10),
      comm(&["a@example.com", "c@example.com"], 30),
      comm(&["b@example.com"], 20),
    ];
    let thread = Thread::from_communications("k", &comms);
    assert!(thread.is_group);
    assert_eq!(thread.message_count, 3);
    assert_eq!(thread.participants_flat(), "a@example.com,b@example.com,c@example.com");
    assert_eq!(thread.last_activity, Some(Utc.timestamp_opt(30, 0).unwrap()));
  }
}

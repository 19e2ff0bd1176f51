//! Raw records: the source-native shape of a message or email before
//! normalization.
//!
//! A [`RawRecord`] is transient: a source adapter produces it and a single
//! ingestion pass consumes it. Nothing in this module is persisted directly.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

// ─── Source ──────────────────────────────────────────────────────────────────

/// Where a record came from. The string form namespaces thread keys and is
/// part of the `(user, source, external_id)` uniqueness key.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
  /// A local message store (`chat.db` layout).
  Messages,
  /// A local device backup directory containing a message store.
  Backup,
  /// A cloud mailbox reached over a REST API.
  Mail,
}

impl SourceKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Messages => "messages",
      Self::Backup => "backup",
      Self::Mail => "mail",
    }
  }
}

impl fmt::Display for SourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SourceKind {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "messages" => Ok(Self::Messages),
      "backup" => Ok(Self::Backup),
      "mail" => Ok(Self::Mail),
      other => Err(Error::UnknownSource(other.to_owned())),
    }
  }
}

// ─── Channel & direction ─────────────────────────────────────────────────────

/// The transport a communication travelled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
  Sms,
  IMessage,
  Email,
  Other,
}

impl Channel {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Sms => "sms",
      Self::IMessage => "imessage",
      Self::Email => "email",
      Self::Other => "other",
    }
  }

  /// Map a message-store `service` column to a channel.
  pub fn from_service(service: Option<&str>) -> Self {
    match service.map(str::to_ascii_lowercase).as_deref() {
      Some("imessage") => Self::IMessage,
      Some("sms") | Some("mms") | Some("rcs") => Self::Sms,
      _ => Self::Other,
    }
  }
}

impl FromStr for Channel {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "sms" => Ok(Self::Sms),
      "imessage" => Ok(Self::IMessage),
      "email" => Ok(Self::Email),
      "other" => Ok(Self::Other),
      other => Err(Error::UnknownChannel(other.to_owned())),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  Inbound,
  Outbound,
}

impl Direction {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Inbound => "inbound",
      Self::Outbound => "outbound",
    }
  }
}

impl FromStr for Direction {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "inbound" => Ok(Self::Inbound),
      "outbound" => Ok(Self::Outbound),
      other => Err(Error::UnknownDirection(other.to_owned())),
    }
  }
}

// ─── Attachments ─────────────────────────────────────────────────────────────

/// A pointer to attachment bytes held by the source. The bytes themselves are
/// fetched lazily through the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
  /// Source-assigned attachment identifier passed back to the adapter.
  pub external_id: String,
  pub filename:    Option<String>,
  pub mime_type:   Option<String>,
  /// Size reported by the source, if any; checked before downloading.
  pub size_hint:   Option<u64>,
}

// ─── RawRecord ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
  pub source:             SourceKind,
  /// Source-provided unique id; drives idempotent re-import.
  pub external_id:        String,
  /// Source-assigned conversation identifier, when the source has one.
  pub conversation_id:    Option<String>,
  pub channel:            Channel,
  pub direction:          Direction,
  pub sent_at:            DateTime<Utc>,
  pub received_at:        Option<DateTime<Utc>>,
  pub sender:             Option<String>,
  /// Every other party to the conversation, as the source reports them.
  pub recipients:         Vec<String>,
  pub subject:            Option<String>,
  pub raw_body:           Option<String>,
  pub raw_rich_text_blob: Option<Vec<u8>>,
  pub attachment_refs:    Vec<AttachmentRef>,
}

impl RawRecord {
  /// Convenience constructor with every optional field empty.
  pub fn new(
    source: SourceKind,
    external_id: impl Into<String>,
    sent_at: DateTime<Utc>,
  ) -> Self {
    Self {
      source,
      external_id: external_id.into(),
      conversation_id: None,
      channel: Channel::Other,
      direction: Direction::Inbound,
      sent_at,
      received_at: None,
      sender: None,
      recipients: Vec::new(),
      subject: None,
      raw_body: None,
      raw_rich_text_blob: None,
      attachment_refs: Vec::new(),
    }
  }

  /// The source conversation id, ignoring blank values.
  pub fn conversation_id(&self) -> Option<&str> {
    self
      .conversation_id
      .as_deref()
      .map(str::trim)
      .filter(|id| !id.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn source_kind_string_roundtrip() {
    for kind in [SourceKind::Messages, SourceKind::Backup, SourceKind::Mail] {
      assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
    }
    assert!("carrier-pigeon".parse::<SourceKind>().is_err());
  }

  #[test]
  fn service_column_maps_to_channel() {
    assert_eq!(Channel::from_service(Some("iMessage")), Channel::IMessage);
    assert_eq!(Channel::from_service(Some("SMS")), Channel::Sms);
    assert_eq!(Channel::from_service(None), Channel::Other);
  }

  #[test]
  fn blank_conversation_id_is_absent() {
    let mut record = RawRecord::new(SourceKind::Messages, "m-1", Utc::now());
    record.conversation_id = Some("   ".into());
    assert_eq!(record.conversation_id(), None);
    record.conversation_id = Some("chat42".into());
    assert_eq!(record.conversation_id(), Some("chat42"));
  }
}

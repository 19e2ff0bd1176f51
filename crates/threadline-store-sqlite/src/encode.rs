//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microseconds, `Z`)
//! so lexical order equals chronological order. Participant lists are compact
//! JSON arrays. UUIDs are hyphenated lowercase strings.

use chrono::{DateTime, SecondsFormat, Utc};
use threadline_core::{
  communication::{AttachmentBlob, AttachmentMeta, NormalizedCommunication},
  link::{LinkRecord, LinkSource, LinkTarget},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Participants ────────────────────────────────────────────────────────────

pub fn encode_participants(participants: &[String]) -> Result<String> {
  Ok(serde_json::to_string(participants)?)
}

pub fn decode_participants(s: &str) -> Result<Vec<String>> {
  Ok(serde_json::from_str(s)?)
}

// ─── Link targets ────────────────────────────────────────────────────────────

/// Split a target into its `(communication_id, thread_id)` column pair.
pub fn encode_target(target: &LinkTarget) -> (Option<String>, Option<String>) {
  match target {
    LinkTarget::Communication(id) => (Some(encode_uuid(*id)), None),
    LinkTarget::Thread(key) => (None, Some(key.clone())),
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw strings read directly from a `communications` row.
pub struct RawCommunication {
  pub id:                String,
  pub user_id:           String,
  pub source:            String,
  pub external_id:       String,
  pub channel:           String,
  pub direction:         String,
  pub participants:      String,
  pub participants_flat: String,
  pub thread_id:         String,
  pub subject:           Option<String>,
  pub body_text:         String,
  pub sent_at:           String,
  pub created_at:        String,
  pub updated_at:        String,
}

/// Column list matching [`RawCommunication::from_row`].
pub const COMMUNICATION_COLUMNS: &str = "id, user_id, source, external_id, channel, direction, \
   participants, participants_flat, thread_id, subject, body_text, sent_at, created_at, updated_at";

impl RawCommunication {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                row.get(0)?,
      user_id:           row.get(1)?,
      source:            row.get(2)?,
      external_id:       row.get(3)?,
      channel:           row.get(4)?,
      direction:         row.get(5)?,
      participants:      row.get(6)?,
      participants_flat: row.get(7)?,
      thread_id:         row.get(8)?,
      subject:           row.get(9)?,
      body_text:         row.get(10)?,
      sent_at:           row.get(11)?,
      created_at:        row.get(12)?,
      updated_at:        row.get(13)?,
    })
  }

  pub fn into_communication(self) -> Result<NormalizedCommunication> {
    Ok(NormalizedCommunication {
      id:                decode_uuid(&self.id)?,
      user_id:           self.user_id,
      channel:           self.channel.parse()?,
      direction:         self.direction.parse()?,
      participants:      decode_participants(&self.participants)?,
      participants_flat: self.participants_flat,
      thread_id:         self.thread_id,
      subject:           self.subject,
      body_text:         self.body_text,
      sent_at:           decode_dt(&self.sent_at)?,
      source:            self.source.parse()?,
      external_id:       self.external_id,
      created_at:        decode_dt(&self.created_at)?,
      updated_at:        decode_dt(&self.updated_at)?,
    })
  }
}

/// Raw strings read directly from a `links` row.
pub struct RawLink {
  pub link_id:          String,
  pub communication_id: Option<String>,
  pub thread_id:        Option<String>,
  pub transaction_id:   String,
  pub link_source:      String,
  pub linked_at:        String,
}

pub const LINK_COLUMNS: &str =
  "link_id, communication_id, thread_id, transaction_id, link_source, linked_at";

impl RawLink {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      link_id:          row.get(0)?,
      communication_id: row.get(1)?,
      thread_id:        row.get(2)?,
      transaction_id:   row.get(3)?,
      link_source:      row.get(4)?,
      linked_at:        row.get(5)?,
    })
  }

  pub fn into_link(self) -> Result<LinkRecord> {
    let target = match (self.communication_id, self.thread_id) {
      (Some(id), None) => LinkTarget::Communication(decode_uuid(&id)?),
      (None, Some(key)) => LinkTarget::Thread(key),
      _ => {
        return Err(Error::Core(threadline_core::Error::MalformedLinkTarget(
          self.link_id,
        )));
      }
    };
    Ok(LinkRecord {
      link_id:        decode_uuid(&self.link_id)?,
      target,
      transaction_id: self.transaction_id,
      link_source:    self.link_source.parse::<LinkSource>()?,
      linked_at:      decode_dt(&self.linked_at)?,
    })
  }
}

/// Raw strings read directly from an `attachments` row.
pub struct RawAttachment {
  pub id:               String,
  pub communication_id: String,
  pub external_id:      String,
  pub filename:         Option<String>,
  pub mime_type:        Option<String>,
  pub content_hash:     String,
}

impl RawAttachment {
  pub fn into_meta(self) -> Result<AttachmentMeta> {
    Ok(AttachmentMeta {
      id:               decode_uuid(&self.id)?,
      communication_id: decode_uuid(&self.communication_id)?,
      external_id:      self.external_id,
      filename:         self.filename,
      mime_type:        self.mime_type,
      content_hash:     self.content_hash,
    })
  }
}

pub fn blob_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttachmentBlob> {
  let size: i64 = row.get(2)?;
  Ok(AttachmentBlob {
    content_hash: row.get(0)?,
    storage_path: row.get(1)?,
    size:         size.max(0) as u64,
  })
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn encoded_timestamps_sort_chronologically() {
    let earlier = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let later = Utc.timestamp_opt(1_700_000_000, 500_000_000).unwrap();
    assert!(encode_dt(earlier) < encode_dt(later));
    assert_eq!(encode_dt(earlier).len(), encode_dt(later).len());
    assert_eq!(decode_dt(&encode_dt(later)).unwrap(), later);
  }
}

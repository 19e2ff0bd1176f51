//! Normalized communications and attachment metadata, as persisted.
//!
//! A communication is created once per `(user, source, external_id)` and is
//! only ever updated by a later authoritative fetch of the same external id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{Channel, Direction, SourceKind};

// ─── Communication ───────────────────────────────────────────────────────────

/// The canonical, deduplicated representation of one message or email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedCommunication {
  pub id:                Uuid,
  pub user_id:           String,
  pub channel:           Channel,
  pub direction:         Direction,
  /// Normalized identifiers of the parties on this record.
  pub participants:      Vec<String>,
  /// Joined identifiers of every participant of the whole thread.
  pub participants_flat: String,
  pub thread_id:         String,
  pub subject:           Option<String>,
  pub body_text:         String,
  pub sent_at:           DateTime<Utc>,
  pub source:            SourceKind,
  pub external_id:       String,
  pub created_at:        DateTime<Utc>,
  pub updated_at:        DateTime<Utc>,
}

/// Input to [`crate::store::CommunicationStore::commit_chunk`].
///
/// `id`, `participants_flat` and the timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommunication {
  pub external_id:  String,
  pub channel:      Channel,
  pub direction:    Direction,
  pub participants: Vec<String>,
  pub thread_id:    String,
  pub subject:      Option<String>,
  pub body_text:    String,
  pub sent_at:      DateTime<Utc>,
}

// ─── Attachments ─────────────────────────────────────────────────────────────

/// One physical file on disk. Many [`AttachmentMeta`] rows may point at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentBlob {
  /// SHA-256 hex digest of the bytes.
  pub content_hash: String,
  /// Path relative to the managed attachment root.
  pub storage_path: String,
  pub size:         u64,
}

/// Metadata row tying a communication to a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
  pub id:               Uuid,
  pub communication_id: Uuid,
  pub external_id:      String,
  pub filename:         Option<String>,
  pub mime_type:        Option<String>,
  pub content_hash:     String,
}

/// An attachment to be recorded alongside its communication in a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
  /// External id of the owning communication within the same chunk write.
  pub communication_external_id: String,
  pub external_id:               String,
  pub filename:                  Option<String>,
  pub mime_type:                 Option<String>,
  pub blob:                      AttachmentBlob,
}

// ─── Chunk commits ───────────────────────────────────────────────────────────

/// Everything one processed chunk writes. Committed atomically.
#[derive(Debug, Clone)]
pub struct ChunkWrite {
  pub user_id:          String,
  pub source:           SourceKind,
  pub communications:   Vec<NewCommunication>,
  pub attachments:      Vec<NewAttachment>,
  /// Overwrite rows whose external id already exists instead of skipping.
  pub refresh_existing: bool,
}

impl ChunkWrite {
  pub fn new(user_id: impl Into<String>, source: SourceKind) -> Self {
    Self {
      user_id: user_id.into(),
      source,
      communications: Vec::new(),
      attachments: Vec::new(),
      refresh_existing: false,
    }
  }
}

/// What a committed chunk changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
  pub inserted:           usize,
  pub updated:            usize,
  /// Rows whose external id already existed and were left untouched.
  pub unchanged:          usize,
  pub attachments_linked: usize,
  pub threads_refreshed:  usize,
}

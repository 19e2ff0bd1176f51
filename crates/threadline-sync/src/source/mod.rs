//! Record sources.
//!
//! A [`SourceAdapter`] yields pages of [`RawRecord`]s and serves attachment
//! bytes by id. Three adapters exist: the local message store
//! ([`MessageDbSource`]), a device backup ([`DeviceBackupSource`]), and a
//! cloud mailbox ([`MailApiSource`]). [`Source`] wraps them for callers that
//! handle several kinds in one run.

use std::future::Future;

use bytes::Bytes;
use threadline_core::record::{RawRecord, SourceKind};

use crate::ratelimit::CallError;

pub mod backup;
pub mod mail;
pub mod message_db;

pub use backup::DeviceBackupSource;
pub use mail::{CredentialProvider, MailApiSource, StaticToken};
pub use message_db::MessageDbSource;

// ─── Page ────────────────────────────────────────────────────────────────────

/// One batch of records and the cursor for the next, if any.
#[derive(Debug, Clone, Default)]
pub struct Page {
  pub records:     Vec<RawRecord>,
  pub next_cursor: Option<String>,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
  #[error("source unavailable: {0}")]
  Unavailable(String),

  #[error("invalid credentials")]
  InvalidCredentials,

  #[error("quota exhausted: {0}")]
  QuotaExhausted(String),

  #[error("rate limited; gave up after {attempts} attempts")]
  RateLimited { attempts: u32 },

  /// The server refused one request (404 and other client errors).
  #[error("request rejected: {0}")]
  Rejected(String),

  #[error("malformed source data: {0}")]
  Parse(String),

  #[error("attachment not found: {0}")]
  AttachmentNotFound(String),

  #[error("source database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("cancelled")]
  Cancelled,
}

impl From<rusqlite::Error> for SourceError {
  fn from(e: rusqlite::Error) -> Self { Self::Database(tokio_rusqlite::Error::Rusqlite(e)) }
}

impl From<CallError<SourceError>> for SourceError {
  fn from(e: CallError<SourceError>) -> Self {
    match e {
      CallError::Fatal(inner) => inner,
      CallError::Exhausted { attempts, rate_limited: true, .. } => Self::RateLimited { attempts },
      CallError::Exhausted { last, .. } => last,
      CallError::Cancelled => Self::Cancelled,
    }
  }
}

// ─── Adapter trait ───────────────────────────────────────────────────────────

pub trait SourceAdapter: Send + Sync {
  fn kind(&self) -> SourceKind;

  /// Records after `cursor` (from the start when `None`), in source order.
  fn fetch_raw_records<'a>(
    &'a self,
    cursor: Option<&'a str>,
  ) -> impl Future<Output = Result<Page, SourceError>> + Send + 'a;

  /// Bytes of one attachment, by the `external_id` of its
  /// [`AttachmentRef`](threadline_core::record::AttachmentRef).
  fn attachment_bytes<'a>(
    &'a self,
    external_attachment_id: &'a str,
  ) -> impl Future<Output = Result<Bytes, SourceError>> + Send + 'a;
}

// ─── Source ──────────────────────────────────────────────────────────────────

pub enum Source {
  Messages(MessageDbSource),
  Backup(DeviceBackupSource),
  Mail(MailApiSource),
}

impl SourceAdapter for Source {
  fn kind(&self) -> SourceKind {
    match self {
      Self::Messages(s) => s.kind(),
      Self::Backup(s) => s.kind(),
      Self::Mail(s) => s.kind(),
    }
  }

  async fn fetch_raw_records(&self, cursor: Option<&str>) -> Result<Page, SourceError> {
    match self {
      Self::Messages(s) => s.fetch_raw_records(cursor).await,
      Self::Backup(s) => s.fetch_raw_records(cursor).await,
      Self::Mail(s) => s.fetch_raw_records(cursor).await,
    }
  }

  async fn attachment_bytes(&self, external_attachment_id: &str) -> Result<Bytes, SourceError> {
    match self {
      Self::Messages(s) => s.attachment_bytes(external_attachment_id).await,
      Self::Backup(s) => s.attachment_bytes(external_attachment_id).await,
      Self::Mail(s) => s.attachment_bytes(external_attachment_id).await,
    }
  }
}

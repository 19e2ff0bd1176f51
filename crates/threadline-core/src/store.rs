//! The `CommunicationStore` trait.
//!
//! Implemented by storage backends (e.g. `threadline-store-sqlite`). The sync
//! engine and the auto-linker depend on this abstraction, not on any concrete
//! backend.

use std::{collections::HashSet, future::Future};

use uuid::Uuid;

use crate::{
  communication::{AttachmentBlob, AttachmentMeta, ChunkWrite, CommitSummary, NormalizedCommunication},
  link::{LinkRecord, LinkTarget},
  record::SourceKind,
};

/// Abstraction over the transactional datastore.
///
/// Writes from ingestion arrive as whole chunks through
/// [`commit_chunk`](Self::commit_chunk); a chunk is either fully committed or
/// not at all. Upserts are keyed on `(user, source, external_id)`.
///
/// All methods return `Send` futures so the trait works inside spawned tasks.
pub trait CommunicationStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Ingestion ─────────────────────────────────────────────────────────

  /// The subset of `external_ids` already persisted for `user_id` + `source`.
  fn known_external_ids<'a>(
    &'a self,
    user_id: &'a str,
    source: SourceKind,
    external_ids: Vec<String>,
  ) -> impl Future<Output = Result<HashSet<String>, Self::Error>> + Send + 'a;

  /// Atomically persist one chunk: upsert its communications, record
  /// attachment blobs and metadata, then refresh `participants_flat` for
  /// every communication of each thread the chunk touched.
  fn commit_chunk(
    &self,
    write: ChunkWrite,
  ) -> impl Future<Output = Result<CommitSummary, Self::Error>> + Send + '_;

  // ── Reads ─────────────────────────────────────────────────────────────

  fn get_communication(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<NormalizedCommunication>, Self::Error>> + Send + '_;

  /// Every communication for `user_id`, ordered by `sent_at`.
  fn list_communications<'a>(
    &'a self,
    user_id: &'a str,
  ) -> impl Future<Output = Result<Vec<NormalizedCommunication>, Self::Error>> + Send + 'a;

  /// Communications sharing `thread_id`, ordered by `sent_at`.
  fn communications_in_thread<'a>(
    &'a self,
    user_id: &'a str,
    thread_id: &'a str,
  ) -> impl Future<Output = Result<Vec<NormalizedCommunication>, Self::Error>> + Send + 'a;

  /// Distinct thread ids for `user_id`.
  fn list_thread_ids<'a>(
    &'a self,
    user_id: &'a str,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + 'a;

  /// Communications whose `participants_flat` may contain any of
  /// `identifiers`. This is a prefilter: callers confirm the exact match.
  fn candidates_for_identifiers<'a>(
    &'a self,
    user_id: &'a str,
    identifiers: Vec<String>,
  ) -> impl Future<Output = Result<Vec<NormalizedCommunication>, Self::Error>> + Send + 'a;

  // ── Attachments ───────────────────────────────────────────────────────

  fn find_blob<'a>(
    &'a self,
    content_hash: &'a str,
  ) -> impl Future<Output = Result<Option<AttachmentBlob>, Self::Error>> + Send + 'a;

  fn attachments_for(
    &self,
    communication_id: Uuid,
  ) -> impl Future<Output = Result<Vec<AttachmentMeta>, Self::Error>> + Send + '_;

  // ── Links ─────────────────────────────────────────────────────────────

  /// Insert `link` unless one already exists for its `(target,
  /// transaction_id)`. Returns `true` when a row was written.
  fn insert_link_if_absent(
    &self,
    link: LinkRecord,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Create a manual link, or promote an existing auto link to manual.
  fn upsert_manual_link<'a>(
    &'a self,
    target: LinkTarget,
    transaction_id: &'a str,
  ) -> impl Future<Output = Result<LinkRecord, Self::Error>> + Send + 'a;

  /// Delete exactly the link for `(target, transaction_id)`. Returns `true`
  /// when a row was removed. Never touches the communication itself.
  fn delete_link<'a>(
    &'a self,
    target: LinkTarget,
    transaction_id: &'a str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  fn links_for_transaction<'a>(
    &'a self,
    transaction_id: &'a str,
  ) -> impl Future<Output = Result<Vec<LinkRecord>, Self::Error>> + Send + 'a;
}

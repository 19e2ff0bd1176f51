//! Record and attachment deduplication.
//!
//! Records are deduplicated by external id against the store, and within the
//! incoming batch itself. Attachment bytes are content-addressed: the file
//! for a given SHA-256 digest is written at most once, and every later
//! reference only adds a metadata row pointing at it.

use std::{
  collections::HashSet,
  path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use threadline_core::{
  communication::AttachmentBlob,
  record::{RawRecord, SourceKind},
  store::CommunicationStore,
};
use uuid::Uuid;

use crate::{Error, Result};

/// 50 MiB.
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 50 * 1024 * 1024;

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct DedupOutcome {
  /// Records to process, in their original order.
  pub fresh:             Vec<RawRecord>,
  /// Records dropped because the store already has their external id.
  pub known:             usize,
  /// Records dropped because an earlier record in the batch had the same id.
  pub repeated_in_batch: usize,
}

impl DedupOutcome {
  pub fn skipped(&self) -> usize { self.known + self.repeated_in_batch }
}

/// Drop records that are already stored or repeated within `records`.
///
/// With `refresh_existing`, stored records are kept so the commit can
/// overwrite them; in-batch repeats are still collapsed to the first
/// occurrence.
pub async fn filter_known<S: CommunicationStore>(
  store: &S,
  user_id: &str,
  source: SourceKind,
  records: Vec<RawRecord>,
  refresh_existing: bool,
) -> Result<DedupOutcome> {
  let mut outcome = DedupOutcome::default();
  let mut seen = HashSet::new();
  let mut unique = Vec::with_capacity(records.len());
  for record in records {
    if seen.insert(record.external_id.clone()) {
      unique.push(record);
    } else {
      outcome.repeated_in_batch += 1;
    }
  }

  if refresh_existing || unique.is_empty() {
    outcome.fresh = unique;
    return Ok(outcome);
  }

  let ids = unique.iter().map(|r| r.external_id.clone()).collect();
  let known = store
    .known_external_ids(user_id, source, ids)
    .await
    .map_err(Error::storage)?;

  for record in unique {
    if known.contains(&record.external_id) {
      outcome.known += 1;
    } else {
      outcome.fresh.push(record);
    }
  }
  Ok(outcome)
}

// ─── Attachments ─────────────────────────────────────────────────────────────

/// Where an attachment's bytes ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredAttachment {
  /// New content; the file was written by this call.
  Written(AttachmentBlob),
  /// The content was already on disk; nothing was written.
  Existing(AttachmentBlob),
}

impl StoredAttachment {
  pub fn blob(&self) -> &AttachmentBlob {
    match self {
      Self::Written(b) | Self::Existing(b) => b,
    }
  }

  pub fn into_blob(self) -> AttachmentBlob {
    match self {
      Self::Written(b) | Self::Existing(b) => b,
    }
  }
}

/// Content-addressed file storage under a managed root.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
  root:      PathBuf,
  max_bytes: u64,
}

impl AttachmentStore {
  pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
    Self { root: root.into(), max_bytes }
  }

  pub fn root(&self) -> &Path { &self.root }

  pub fn max_bytes(&self) -> u64 { self.max_bytes }

  pub fn exceeds_limit(&self, size: u64) -> bool { size > self.max_bytes }

  /// `ab/abcdef…`: the first two hex characters shard the directory.
  pub fn relative_path(content_hash: &str) -> String {
    let shard = content_hash.get(..2).unwrap_or(content_hash);
    format!("{shard}/{content_hash}")
  }

  pub fn absolute_path(&self, blob: &AttachmentBlob) -> PathBuf { self.root.join(&blob.storage_path) }

  /// Persist `bytes` unless identical content is already stored.
  ///
  /// The digest is computed first. A file already at the content path means
  /// nothing is written. A blob row whose file has gone missing gets the file
  /// written back. New files go to a temporary name in the shard directory
  /// and are renamed into place, so a reader never sees a partial file.
  pub async fn persist<S: CommunicationStore>(
    &self,
    store: &S,
    bytes: &[u8],
  ) -> Result<StoredAttachment> {
    let content_hash = hex::encode(Sha256::digest(bytes));

    if let Some(existing) = store.find_blob(&content_hash).await.map_err(Error::storage)? {
      let path = self.absolute_path(&existing);
      if !tokio::fs::try_exists(&path).await? {
        self.write_file(&path, bytes).await?;
        tracing::warn!(hash = %existing.content_hash, "attachment file was missing; restored");
      }
      return Ok(StoredAttachment::Existing(existing));
    }

    let blob = AttachmentBlob {
      storage_path: Self::relative_path(&content_hash),
      size: bytes.len() as u64,
      content_hash,
    };
    let path = self.absolute_path(&blob);

    if tokio::fs::try_exists(&path).await? {
      return Ok(StoredAttachment::Existing(blob));
    }

    self.write_file(&path, bytes).await?;
    tracing::debug!(hash = %blob.content_hash, size = blob.size, "attachment stored");
    Ok(StoredAttachment::Written(blob))
  }

  /// Write to a temporary sibling, then rename onto `path`.
  async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().map_or_else(|| self.root.clone(), Path::to_path_buf);
    tokio::fs::create_dir_all(&dir).await?;
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let tmp = dir.join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
      let _ = tokio::fs::remove_file(&tmp).await;
      return Err(e.into());
    }
    Ok(())
  }
}

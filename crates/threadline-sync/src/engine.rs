//! Sync orchestration.
//!
//! [`SyncEngine::run`] drives one source to completion: fetch a page, drop
//! known records, then process the rest in chunks. Each chunk extracts
//! text, computes participants and the thread key, stores attachments, and
//! commits once. A cancelled or failed run keeps every chunk committed
//! before it and nothing after.

use std::{fmt, path::PathBuf};

use threadline_core::{
  communication::{ChunkWrite, CommitSummary, NewAttachment, NewCommunication},
  record::{AttachmentRef, RawRecord, SourceKind},
  store::CommunicationStore,
  thread::{participant_set, thread_key},
};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
  Error, Result,
  chunk::{ChunkOptions, ChunkStep, Yielder, process_in_chunks},
  dedup::{AttachmentStore, DEFAULT_MAX_ATTACHMENT_BYTES, StoredAttachment, filter_known},
  source::{SourceAdapter, SourceError},
};

// ─── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncOptions {
  pub user_id:              String,
  pub chunk:                ChunkOptions,
  /// Overwrite communications whose external id is already stored.
  pub refresh_existing:     bool,
  pub attachment_root:      PathBuf,
  pub max_attachment_bytes: u64,
}

impl SyncOptions {
  pub fn new(user_id: impl Into<String>, attachment_root: impl Into<PathBuf>) -> Self {
    Self {
      user_id:              user_id.into(),
      chunk:                ChunkOptions::default(),
      refresh_existing:     false,
      attachment_root:      attachment_root.into(),
      max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
    }
  }
}

// ─── Progress & reports ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
  Fetching,
  Processing,
  Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
  pub phase:   SyncPhase,
  /// Records processed so far in this run.
  pub current: usize,
  /// Records known to need processing so far; grows page by page.
  pub total:   usize,
}

impl SyncProgress {
  pub fn fetching(current: usize) -> Self { Self { phase: SyncPhase::Fetching, current, total: current } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  /// Credentials, network or unreadable source data. Other sources continue.
  SourceUnavailable,
  RateLimited,
  /// The datastore failed. Halts the whole run.
  Storage,
  /// The sync task itself died.
  Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
  Completed,
  Cancelled,
  Failed { kind: FailureKind, reason: String },
}

impl fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Completed => f.write_str("completed"),
      Self::Cancelled => f.write_str("cancelled"),
      Self::Failed { kind, reason } => write!(f, "failed ({kind:?}): {reason}"),
    }
  }
}

/// Counts for one source run. Always produced, even on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  pub source:                   SourceKind,
  pub status:                   SyncStatus,
  pub inserted:                 usize,
  pub updated:                  usize,
  pub skipped_duplicates:       usize,
  pub skipped_oversized:        usize,
  pub failed_attachments:       usize,
  pub attachments_stored:       usize,
  pub attachments_deduplicated: usize,
  pub empty_bodies:             usize,
  pub pages:                    usize,
}

impl SyncReport {
  fn new(source: SourceKind) -> Self {
    Self {
      source,
      status: SyncStatus::Completed,
      inserted: 0,
      updated: 0,
      skipped_duplicates: 0,
      skipped_oversized: 0,
      failed_attachments: 0,
      attachments_stored: 0,
      attachments_deduplicated: 0,
      empty_bodies: 0,
      pages: 0,
    }
  }

  /// Whether later sources should still run after this one.
  pub fn halts_run(&self) -> bool {
    matches!(
      self.status,
      SyncStatus::Cancelled | SyncStatus::Failed { kind: FailureKind::Storage | FailureKind::Aborted, .. }
    )
  }

  fn absorb(&mut self, tally: ChunkTally) {
    self.inserted += tally.summary.inserted;
    self.updated += tally.summary.updated;
    // Rows that raced in between the dedup lookup and the commit.
    self.skipped_duplicates += tally.summary.unchanged;
    self.skipped_oversized += tally.skipped_oversized;
    self.failed_attachments += tally.failed_attachments;
    self.attachments_stored += tally.attachments_stored;
    self.attachments_deduplicated += tally.attachments_deduplicated;
    self.empty_bodies += tally.empty_bodies;
  }
}

impl FailureKind {
  fn of(error: &Error) -> Self {
    match error {
      Error::RateLimited(_) => Self::RateLimited,
      Error::Storage(_) | Error::Io(_) => Self::Storage,
      Error::SourceUnavailable(_) | Error::Contacts(_) | Error::Cancelled => Self::SourceUnavailable,
    }
  }
}

/// Per-chunk counters, merged into the report once the chunk commits.
#[derive(Debug, Default)]
struct ChunkTally {
  summary:                  CommitSummary,
  skipped_oversized:        usize,
  failed_attachments:       usize,
  attachments_stored:       usize,
  attachments_deduplicated: usize,
  empty_bodies:             usize,
}

enum AttachmentOutcome {
  Stored(StoredAttachment),
  Oversized,
  Failed,
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// A sync running on its own task.
pub struct SyncHandle {
  source:   SourceKind,
  progress: watch::Receiver<SyncProgress>,
  cancel:   CancellationToken,
  task:     JoinHandle<SyncReport>,
}

impl SyncHandle {
  pub fn progress(&self) -> watch::Receiver<SyncProgress> { self.progress.clone() }

  /// Request cancellation. Chunks already committed stay committed.
  pub fn cancel(&self) { self.cancel.cancel() }

  pub fn cancellation_token(&self) -> CancellationToken { self.cancel.clone() }

  pub async fn join(self) -> SyncReport {
    match self.task.await {
      Ok(report) => report,
      Err(e) => {
        tracing::error!(source = %self.source, error = %e, "sync task aborted");
        let mut report = SyncReport::new(self.source);
        report.status = SyncStatus::Failed { kind: FailureKind::Aborted, reason: e.to_string() };
        report
      }
    }
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SyncEngine<S> {
  store: S,
}

impl<S: CommunicationStore> SyncEngine<S> {
  pub fn new(store: S) -> Self { Self { store } }

  pub fn store(&self) -> &S { &self.store }

  /// Spawn a run of `source` and return a handle to it.
  pub fn start_sync<A>(&self, source: A, options: SyncOptions) -> SyncHandle
  where
    S: Clone + 'static,
    A: SourceAdapter + 'static,
  {
    let (tx, rx) = watch::channel(SyncProgress::fetching(0));
    let cancel = CancellationToken::new();
    let kind = source.kind();

    let engine = self.clone();
    let token = cancel.clone();
    let task = tokio::spawn(async move { engine.run(&source, &options, &tx, &token).await });

    SyncHandle { source: kind, progress: rx, cancel, task }
  }

  /// Sync `source` to completion, cancellation or failure.
  pub async fn run<A: SourceAdapter>(
    &self,
    source: &A,
    options: &SyncOptions,
    progress: &watch::Sender<SyncProgress>,
    cancel: &CancellationToken,
  ) -> SyncReport {
    let kind = source.kind();
    let mut report = SyncReport::new(kind);
    tracing::info!(source = %kind, user = %options.user_id, "sync started");

    let mut processed = 0;
    let outcome = self.drive(source, options, progress, cancel, &mut report, &mut processed).await;
    report.status = match outcome {
      Ok(true) => SyncStatus::Completed,
      Ok(false) | Err(Error::Cancelled) => SyncStatus::Cancelled,
      Err(e) => {
        tracing::error!(source = %kind, error = %e, "sync failed");
        SyncStatus::Failed { kind: FailureKind::of(&e), reason: e.to_string() }
      }
    };

    progress.send_replace(SyncProgress { phase: SyncPhase::Done, current: processed, total: processed });
    tracing::info!(
      source = %kind,
      status = ?report.status,
      inserted = report.inserted,
      updated = report.updated,
      skipped_duplicates = report.skipped_duplicates,
      skipped_oversized = report.skipped_oversized,
      failed_attachments = report.failed_attachments,
      pages = report.pages,
      "sync finished"
    );
    report
  }

  /// Returns `Ok(false)` when cancelled.
  async fn drive<A: SourceAdapter>(
    &self,
    source: &A,
    options: &SyncOptions,
    progress: &watch::Sender<SyncProgress>,
    cancel: &CancellationToken,
    report: &mut SyncReport,
    processed: &mut usize,
  ) -> Result<bool> {
    let attachments = AttachmentStore::new(&options.attachment_root, options.max_attachment_bytes);
    let mut cursor: Option<String> = None;

    loop {
      progress.send_replace(SyncProgress::fetching(*processed));
      let page = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(false),
        page = source.fetch_raw_records(cursor.as_deref()) => page?,
      };
      report.pages += 1;

      let outcome = filter_known(
        &self.store,
        &options.user_id,
        source.kind(),
        page.records,
        options.refresh_existing,
      )
      .await?;
      report.skipped_duplicates += outcome.skipped();

      let base = *processed;
      let page_total = base + outcome.fresh.len();
      let run = process_in_chunks(
        outcome.fresh,
        options.chunk,
        |chunk, yielder| self.process_chunk(source, &attachments, options, chunk, yielder, cancel),
        |p| {
          progress.send_replace(SyncProgress {
            phase:   SyncPhase::Processing,
            current: base + p.current,
            total:   page_total,
          });
        },
        cancel,
      )
      .await;

      let run = match run {
        Ok(run) => run,
        Err(failure) => {
          *processed += failure.processed;
          failure.completed.into_iter().for_each(|t| report.absorb(t));
          return Err(failure.error);
        }
      };
      *processed += run.processed;
      run.results.into_iter().for_each(|t| report.absorb(t));
      if run.cancelled {
        return Ok(false);
      }

      match page.next_cursor {
        Some(next) if cursor.as_deref() == Some(next.as_str()) => {
          tracing::warn!(source = %source.kind(), cursor = %next, "source repeated its cursor; stopping");
          return Ok(true);
        }
        Some(next) => cursor = Some(next),
        None => return Ok(true),
      }
    }
  }

  async fn process_chunk<A: SourceAdapter>(
    &self,
    source: &A,
    attachments: &AttachmentStore,
    options: &SyncOptions,
    records: Vec<RawRecord>,
    mut yielder: Yielder,
    cancel: &CancellationToken,
  ) -> Result<ChunkStep<ChunkTally>> {
    let mut tally = ChunkTally::default();
    let mut write = ChunkWrite::new(options.user_id.clone(), source.kind());
    write.refresh_existing = options.refresh_existing;

    for record in records {
      if yielder.tick().await.is_err() {
        return Ok(ChunkStep::Abandoned);
      }

      let extraction = threadline_richtext::extract(
        &record.external_id,
        record.raw_body.as_deref(),
        record.raw_rich_text_blob.as_deref(),
      );
      if extraction.is_empty() {
        tally.empty_bodies += 1;
      }

      for attachment in &record.attachment_refs {
        match self.store_attachment(source, attachments, attachment, cancel).await {
          Ok(AttachmentOutcome::Stored(stored)) => {
            match stored {
              StoredAttachment::Written(_) => tally.attachments_stored += 1,
              StoredAttachment::Existing(_) => tally.attachments_deduplicated += 1,
            }
            write.attachments.push(NewAttachment {
              communication_external_id: record.external_id.clone(),
              external_id:               attachment.external_id.clone(),
              filename:                  attachment.filename.clone(),
              mime_type:                 attachment.mime_type.clone(),
              blob:                      stored.into_blob(),
            });
          }
          Ok(AttachmentOutcome::Oversized) => tally.skipped_oversized += 1,
          Ok(AttachmentOutcome::Failed) => tally.failed_attachments += 1,
          Err(Error::Cancelled) => return Ok(ChunkStep::Abandoned),
          Err(e) => return Err(e),
        }
      }

      write.communications.push(NewCommunication {
        participants: participant_set(&record).into_iter().collect(),
        thread_id:    thread_key(&record),
        external_id:  record.external_id,
        channel:      record.channel,
        direction:    record.direction,
        subject:      record.subject,
        body_text:    extraction.text,
        sent_at:      record.sent_at,
      });
    }

    if yielder.check().is_err() {
      return Ok(ChunkStep::Abandoned);
    }

    let records = write.communications.len();
    tally.summary = self.store.commit_chunk(write).await.map_err(Error::storage)?;
    tracing::info!(
      source = %source.kind(),
      records,
      inserted = tally.summary.inserted,
      updated = tally.summary.updated,
      "chunk committed"
    );
    Ok(ChunkStep::Committed(tally))
  }

  /// Fetch and persist one attachment. Source and disk failures affect only
  /// this attachment; storage failures propagate.
  async fn store_attachment<A: SourceAdapter>(
    &self,
    source: &A,
    attachments: &AttachmentStore,
    attachment: &AttachmentRef,
    cancel: &CancellationToken,
  ) -> Result<AttachmentOutcome> {
    let id = attachment.external_id.as_str();
    if let Some(size) = attachment.size_hint.filter(|s| attachments.exceeds_limit(*s)) {
      tracing::warn!(attachment = id, size, limit = attachments.max_bytes(), "attachment over size limit; skipped");
      return Ok(AttachmentOutcome::Oversized);
    }

    let fetched = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(Error::Cancelled),
      fetched = source.attachment_bytes(id) => fetched,
    };
    let bytes = match fetched {
      Ok(bytes) => bytes,
      Err(SourceError::Cancelled) => return Err(Error::Cancelled),
      Err(error) => {
        tracing::warn!(attachment = id, %error, "attachment fetch failed");
        return Ok(AttachmentOutcome::Failed);
      }
    };

    let size = bytes.len() as u64;
    if attachments.exceeds_limit(size) {
      tracing::warn!(attachment = id, size, limit = attachments.max_bytes(), "attachment over size limit; skipped");
      return Ok(AttachmentOutcome::Oversized);
    }

    match attachments.persist(&self.store, &bytes).await {
      Ok(stored) => Ok(AttachmentOutcome::Stored(stored)),
      Err(Error::Io(error)) => {
        tracing::warn!(attachment = id, %error, "attachment write failed");
        Ok(AttachmentOutcome::Failed)
      }
      Err(e) => Err(e),
    }
  }
}

/// Run `sources` one after another.
///
/// A source that fails on its own (unavailable, rate limited) is reported and
/// the next one runs. Cancellation or a storage failure stops the sequence.
pub async fn sync_all<S, A>(
  engine: &SyncEngine<S>,
  sources: &[A],
  options: &SyncOptions,
  progress: &watch::Sender<SyncProgress>,
  cancel: &CancellationToken,
) -> Vec<SyncReport>
where
  S: CommunicationStore,
  A: SourceAdapter,
{
  let mut reports = Vec::with_capacity(sources.len());
  for source in sources {
    let report = engine.run(source, options, progress, cancel).await;
    let halt = report.halts_run();
    reports.push(report);
    if halt {
      tracing::warn!(remaining = sources.len() - reports.len(), "sync run halted");
      break;
    }
  }
  reports
}

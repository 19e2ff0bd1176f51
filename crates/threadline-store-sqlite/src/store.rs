//! [`SqliteStore`], the SQLite implementation of [`CommunicationStore`].

use std::{
  collections::{BTreeSet, HashMap, HashSet},
  path::Path,
  time::Duration,
};

use chrono::Utc;
use rusqlite::{OpenFlags, OptionalExtension as _};
use uuid::Uuid;

use threadline_core::{
  communication::{
    AttachmentBlob, AttachmentMeta, ChunkWrite, CommitSummary, NormalizedCommunication,
  },
  link::{LinkRecord, LinkSource, LinkTarget},
  record::SourceKind,
  store::CommunicationStore,
  thread::{participants_flat, thread_participants},
};

use crate::{
  encode::{
    blob_from_row, encode_dt, encode_participants, encode_target, encode_uuid,
    RawAttachment, RawCommunication, RawLink, COMMUNICATION_COLUMNS, LINK_COLUMNS,
  },
  schema::SCHEMA,
  Result,
};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Store ───────────────────────────────────────────────────────────────────

/// A threadline datastore backed by a single SQLite file.
///
/// Cloning is cheap and shares the connection. Each call to
/// [`open`](Self::open) or [`open_reader`](Self::open_reader) creates an
/// independent connection with its own background thread; concurrent
/// workers must each open their own rather than share one.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open a read-only connection to an existing store. Readers never block
  /// the writer in WAL mode.
  pub async fn open_reader(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_with_flags(
      path,
      OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .await?;
    conn
      .call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(())
      })
      .await?;
    Ok(Self { conn })
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run a `SELECT {COMMUNICATION_COLUMNS}` query and decode the rows.
  async fn query_communications(
    &self,
    sql: String,
    params: Vec<String>,
  ) -> Result<Vec<NormalizedCommunication>> {
    let raws: Vec<RawCommunication> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params.iter()), RawCommunication::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawCommunication::into_communication).collect()
  }
}

/// A communication row with every column pre-encoded, ready to move into the
/// connection thread.
struct EncodedCommunication {
  external_id:  String,
  channel:      &'static str,
  direction:    &'static str,
  participants: String,
  thread_id:    String,
  subject:      Option<String>,
  body_text:    String,
  sent_at:      String,
}

fn json_error(e: serde_json::Error) -> tokio_rusqlite::Error {
  tokio_rusqlite::Error::Other(Box::new(e))
}

// ─── CommunicationStore impl ─────────────────────────────────────────────────

impl CommunicationStore for SqliteStore {
  type Error = crate::Error;

  // ── Ingestion ─────────────────────────────────────────────────────────────

  async fn known_external_ids(
    &self,
    user_id: &str,
    source: SourceKind,
    external_ids: Vec<String>,
  ) -> Result<HashSet<String>> {
    if external_ids.is_empty() {
      return Ok(HashSet::new());
    }
    let user_id = user_id.to_owned();
    let source = source.as_str();

    let known = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT 1 FROM communications
           WHERE user_id = ?1 AND source = ?2 AND external_id = ?3",
        )?;
        let mut known = HashSet::new();
        for id in external_ids {
          if stmt.exists(rusqlite::params![user_id, source, id])? {
            known.insert(id);
          }
        }
        Ok(known)
      })
      .await?;

    Ok(known)
  }

  async fn commit_chunk(&self, write: ChunkWrite) -> Result<CommitSummary> {
    let ChunkWrite { user_id, source, communications, attachments, refresh_existing } = write;
    let source = source.as_str();
    let now = encode_dt(Utc::now());

    let encoded = communications
      .into_iter()
      .map(|c| {
        Ok(EncodedCommunication {
          participants: encode_participants(&c.participants)?,
          external_id:  c.external_id,
          channel:      c.channel.as_str(),
          direction:    c.direction.as_str(),
          thread_id:    c.thread_id,
          subject:      c.subject,
          body_text:    c.body_text,
          sent_at:      encode_dt(c.sent_at),
        })
      })
      .collect::<Result<Vec<_>>>()?;

    let summary = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut summary = CommitSummary::default();
        let mut ids: HashMap<String, String> = HashMap::new();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        // Communications: insert, refresh, or leave untouched.
        {
          let mut find = tx.prepare_cached(
            "SELECT id, thread_id FROM communications
             WHERE user_id = ?1 AND source = ?2 AND external_id = ?3",
          )?;
          let mut insert = tx.prepare_cached(
            "INSERT INTO communications (
               id, user_id, source, external_id, channel, direction,
               participants, thread_id, subject, body_text, sent_at,
               created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
          )?;
          let mut update = tx.prepare_cached(
            "UPDATE communications
             SET channel = ?2, direction = ?3, participants = ?4, thread_id = ?5,
                 subject = ?6, body_text = ?7, sent_at = ?8, updated_at = ?9
             WHERE id = ?1",
          )?;

          for c in &encoded {
            let existing: Option<(String, String)> = find
              .query_row(rusqlite::params![user_id, source, c.external_id], |r| {
                Ok((r.get(0)?, r.get(1)?))
              })
              .optional()?;

            match existing {
              Some((id, old_thread)) if refresh_existing => {
                update.execute(rusqlite::params![
                  id,
                  c.channel,
                  c.direction,
                  c.participants,
                  c.thread_id,
                  c.subject,
                  c.body_text,
                  c.sent_at,
                  now,
                ])?;
                summary.updated += 1;
                touched.insert(old_thread);
                touched.insert(c.thread_id.clone());
                ids.insert(c.external_id.clone(), id);
              }
              Some((id, _)) => {
                summary.unchanged += 1;
                ids.insert(c.external_id.clone(), id);
              }
              None => {
                let id = encode_uuid(Uuid::new_v4());
                insert.execute(rusqlite::params![
                  id,
                  user_id,
                  source,
                  c.external_id,
                  c.channel,
                  c.direction,
                  c.participants,
                  c.thread_id,
                  c.subject,
                  c.body_text,
                  c.sent_at,
                  now,
                ])?;
                summary.inserted += 1;
                touched.insert(c.thread_id.clone());
                ids.insert(c.external_id.clone(), id);
              }
            }
          }
        }

        // Attachments: one blob row per hash, one metadata row per reference.
        {
          let mut blob = tx.prepare_cached(
            "INSERT INTO attachment_blobs (content_hash, storage_path, size, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(content_hash) DO NOTHING",
          )?;
          let mut meta = tx.prepare_cached(
            "INSERT INTO attachments (
               id, communication_id, external_id, filename, mime_type, content_hash
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(communication_id, external_id) DO NOTHING",
          )?;

          for a in &attachments {
            let Some(comm_id) = ids.get(&a.communication_external_id) else {
              tracing::warn!(
                attachment = %a.external_id,
                communication = %a.communication_external_id,
                "attachment references a communication outside its chunk; dropped"
              );
              continue;
            };
            blob.execute(rusqlite::params![
              a.blob.content_hash,
              a.blob.storage_path,
              a.blob.size as i64,
              now,
            ])?;
            summary.attachments_linked += meta.execute(rusqlite::params![
              encode_uuid(Uuid::new_v4()),
              comm_id,
              a.external_id,
              a.filename,
              a.mime_type,
              a.blob.content_hash,
            ])?;
          }
        }

        // Threads: every communication carries all participants of its thread.
        {
          let mut select = tx.prepare_cached(
            "SELECT participants FROM communications WHERE user_id = ?1 AND thread_id = ?2",
          )?;
          let mut update = tx.prepare_cached(
            "UPDATE communications SET participants_flat = ?3
             WHERE user_id = ?1 AND thread_id = ?2",
          )?;

          for thread_id in &touched {
            let lists = select
              .query_map(rusqlite::params![user_id, thread_id], |r| r.get::<_, String>(0))?
              .collect::<rusqlite::Result<Vec<_>>>()?;
            let decoded = lists
              .iter()
              .map(|s| serde_json::from_str::<Vec<String>>(s))
              .collect::<Result<Vec<_>, _>>()
              .map_err(json_error)?;
            let set = thread_participants(decoded.iter().map(Vec::as_slice));
            update.execute(rusqlite::params![user_id, thread_id, participants_flat(&set)])?;
            summary.threads_refreshed += 1;
          }
        }

        tx.commit()?;
        Ok(summary)
      })
      .await?;

    tracing::debug!(
      inserted = summary.inserted,
      updated = summary.updated,
      unchanged = summary.unchanged,
      threads = summary.threads_refreshed,
      "chunk committed"
    );
    Ok(summary)
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  async fn get_communication(&self, id: Uuid) -> Result<Option<NormalizedCommunication>> {
    let mut rows = self
      .query_communications(
        format!("SELECT {COMMUNICATION_COLUMNS} FROM communications WHERE id = ?1"),
        vec![encode_uuid(id)],
      )
      .await?;
    Ok(rows.pop())
  }

  async fn list_communications(&self, user_id: &str) -> Result<Vec<NormalizedCommunication>> {
    self
      .query_communications(
        format!(
          "SELECT {COMMUNICATION_COLUMNS} FROM communications
           WHERE user_id = ?1 ORDER BY sent_at, external_id"
        ),
        vec![user_id.to_owned()],
      )
      .await
  }

  async fn communications_in_thread(
    &self,
    user_id: &str,
    thread_id: &str,
  ) -> Result<Vec<NormalizedCommunication>> {
    self
      .query_communications(
        format!(
          "SELECT {COMMUNICATION_COLUMNS} FROM communications
           WHERE user_id = ?1 AND thread_id = ?2 ORDER BY sent_at, external_id"
        ),
        vec![user_id.to_owned(), thread_id.to_owned()],
      )
      .await
  }

  async fn list_thread_ids(&self, user_id: &str) -> Result<Vec<String>> {
    let user_id = user_id.to_owned();
    let ids = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT DISTINCT thread_id FROM communications WHERE user_id = ?1 ORDER BY thread_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![user_id], |r| r.get::<_, String>(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(ids)
  }

  async fn candidates_for_identifiers(
    &self,
    user_id: &str,
    identifiers: Vec<String>,
  ) -> Result<Vec<NormalizedCommunication>> {
    let mut seen: HashMap<Uuid, NormalizedCommunication> = HashMap::new();
    for identifier in identifiers.into_iter().filter(|i| !i.is_empty()) {
      let rows = self
        .query_communications(
          format!(
            "SELECT {COMMUNICATION_COLUMNS} FROM communications
             WHERE user_id = ?1 AND instr(participants_flat, ?2) > 0"
          ),
          vec![user_id.to_owned(), identifier],
        )
        .await?;
      for row in rows {
        seen.entry(row.id).or_insert(row);
      }
    }

    let mut candidates: Vec<_> = seen.into_values().collect();
    candidates.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.external_id.cmp(&b.external_id)));
    Ok(candidates)
  }

  // ── Attachments ───────────────────────────────────────────────────────────

  async fn find_blob(&self, content_hash: &str) -> Result<Option<AttachmentBlob>> {
    let hash = content_hash.to_owned();
    let blob = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT content_hash, storage_path, size FROM attachment_blobs
               WHERE content_hash = ?1",
              rusqlite::params![hash],
              blob_from_row,
            )
            .optional()?,
        )
      })
      .await?;
    Ok(blob)
  }

  async fn attachments_for(&self, communication_id: Uuid) -> Result<Vec<AttachmentMeta>> {
    let id_str = encode_uuid(communication_id);
    let raws: Vec<RawAttachment> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT id, communication_id, external_id, filename, mime_type, content_hash
           FROM attachments WHERE communication_id = ?1 ORDER BY external_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| {
            Ok(RawAttachment {
              id:               row.get(0)?,
              communication_id: row.get(1)?,
              external_id:      row.get(2)?,
              filename:         row.get(3)?,
              mime_type:        row.get(4)?,
              content_hash:     row.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawAttachment::into_meta).collect()
  }

  // ── Links ─────────────────────────────────────────────────────────────────

  async fn insert_link_if_absent(&self, link: LinkRecord) -> Result<bool> {
    let (comm_id, thread_id) = encode_target(&link.target);
    let link_id = encode_uuid(link.link_id);
    let at = encode_dt(link.linked_at);
    let source = link.link_source.as_str();
    let txn = link.transaction_id;

    let written = self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          "INSERT INTO links (
             link_id, communication_id, thread_id, transaction_id, link_source, linked_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT DO NOTHING",
          rusqlite::params![link_id, comm_id, thread_id, txn, source, at],
        )?;
        Ok(n == 1)
      })
      .await?;
    Ok(written)
  }

  async fn upsert_manual_link(
    &self,
    target: LinkTarget,
    transaction_id: &str,
  ) -> Result<LinkRecord> {
    let fresh = LinkRecord::new(target, transaction_id, LinkSource::Manual);
    let (comm_id, thread_id) = encode_target(&fresh.target);
    let link_id = encode_uuid(fresh.link_id);
    let at = encode_dt(fresh.linked_at);
    let txn = fresh.transaction_id.clone();

    let raw: RawLink = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO links (
             link_id, communication_id, thread_id, transaction_id, link_source, linked_at
           ) VALUES (?1, ?2, ?3, ?4, 'manual', ?5)
           ON CONFLICT DO NOTHING",
          rusqlite::params![link_id, comm_id, thread_id, txn, at],
        )?;
        tx.execute(
          "UPDATE links SET link_source = 'manual'
           WHERE communication_id IS ?1 AND thread_id IS ?2 AND transaction_id = ?3",
          rusqlite::params![comm_id, thread_id, txn],
        )?;
        let raw = tx.query_row(
          &format!(
            "SELECT {LINK_COLUMNS} FROM links
             WHERE communication_id IS ?1 AND thread_id IS ?2 AND transaction_id = ?3"
          ),
          rusqlite::params![comm_id, thread_id, txn],
          RawLink::from_row,
        )?;
        tx.commit()?;
        Ok(raw)
      })
      .await?;

    raw.into_link()
  }

  async fn delete_link(&self, target: LinkTarget, transaction_id: &str) -> Result<bool> {
    let (comm_id, thread_id) = encode_target(&target);
    let txn = transaction_id.to_owned();
    let removed = self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          "DELETE FROM links
           WHERE communication_id IS ?1 AND thread_id IS ?2 AND transaction_id = ?3",
          rusqlite::params![comm_id, thread_id, txn],
        )?;
        Ok(n > 0)
      })
      .await?;
    Ok(removed)
  }

  async fn links_for_transaction(&self, transaction_id: &str) -> Result<Vec<LinkRecord>> {
    let txn = transaction_id.to_owned();
    let raws: Vec<RawLink> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {LINK_COLUMNS} FROM links WHERE transaction_id = ?1 ORDER BY linked_at, link_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![txn], RawLink::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawLink::into_link).collect()
  }
}

//! Local message store reader (`chat.db` layout).
//!
//! Tables used: `message`, `handle`, `chat`, `chat_message_join`,
//! `chat_handle_join`, `attachment`, `message_attachment_join`. The file is
//! opened read-only on a connection owned by this adapter. Paging is keyed on
//! `message.ROWID`, which only grows.

use std::{
  collections::HashMap,
  io::ErrorKind,
  path::{Path, PathBuf},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{OpenFlags, OptionalExtension as _};
use threadline_core::record::{AttachmentRef, Channel, Direction, RawRecord, SourceKind};

use super::{Page, SourceAdapter, SourceError};

pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Seconds between the Unix epoch and 2001-01-01T00:00:00Z.
const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

/// Timestamps above this magnitude are nanoseconds rather than seconds.
const NANOSECOND_THRESHOLD: i64 = 1_000_000_000_000;

const ROWID_PREFIX: &str = "rowid:";

/// A message store timestamp (seconds or nanoseconds since 2001) as UTC.
pub fn apple_time(value: i64) -> DateTime<Utc> {
  let (secs, nanos) = if value.abs() > NANOSECOND_THRESHOLD {
    (value.div_euclid(1_000_000_000), value.rem_euclid(1_000_000_000))
  } else {
    (value, 0)
  };
  DateTime::from_timestamp(secs + APPLE_EPOCH_OFFSET, nanos as u32).unwrap_or_default()
}

// ─── Attachment resolution ───────────────────────────────────────────────────

/// Maps an `attachment.filename` value to a file on disk.
pub(crate) enum AttachmentResolver {
  /// Paths are absolute or `~`-relative to this home directory.
  Home(PathBuf),
  /// Paths are looked up in a backup manifest.
  Manifest {
    root:     PathBuf,
    manifest: tokio_rusqlite::Connection,
  },
}

impl AttachmentResolver {
  async fn resolve(&self, filename: &str) -> Result<PathBuf, SourceError> {
    match self {
      Self::Home(home) => Ok(expand_home(filename, home)),
      Self::Manifest { root, manifest } => {
        let relative = device_relative_path(filename).to_owned();
        let lookup = relative.clone();
        let file_id: Option<String> = manifest
          .call(move |conn| {
            Ok(
              conn
                .query_row(
                  "SELECT fileID FROM Files WHERE domain = 'MediaDomain' AND relativePath = ?1",
                  rusqlite::params![lookup],
                  |r| r.get(0),
                )
                .optional()?,
            )
          })
          .await?;
        let file_id = file_id.ok_or(SourceError::AttachmentNotFound(relative))?;
        Ok(super::backup::manifest_file_path(root, &file_id))
      }
    }
  }
}

fn expand_home(path: &str, home: &Path) -> PathBuf {
  if path == "~" {
    home.to_path_buf()
  } else if let Some(rest) = path.strip_prefix("~/") {
    home.join(rest)
  } else {
    PathBuf::from(path)
  }
}

/// `~/Library/SMS/…` and `/var/mobile/Library/SMS/…` both become
/// `Library/SMS/…`, the form a backup manifest indexes.
fn device_relative_path(path: &str) -> &str {
  path
    .strip_prefix("~/")
    .or_else(|| path.strip_prefix("/var/mobile/"))
    .or_else(|| path.strip_prefix("/private/var/mobile/"))
    .unwrap_or(path)
    .trim_start_matches('/')
}

// ─── Rows ────────────────────────────────────────────────────────────────────

struct MessageRow {
  rowid:                 i64,
  guid:                  Option<String>,
  text:                  Option<String>,
  attributed_body:       Option<Vec<u8>>,
  service:               Option<String>,
  date:                  i64,
  date_delivered:        Option<i64>,
  is_from_me:            bool,
  destination_caller_id: Option<String>,
  subject:               Option<String>,
  handle:                Option<String>,
  chat_id:               Option<i64>,
  chat_guid:             Option<String>,
  chat_handles:          Vec<String>,
  attachments:           Vec<AttachmentRow>,
}

struct AttachmentRow {
  rowid:         i64,
  guid:          Option<String>,
  mime_type:     Option<String>,
  total_bytes:   Option<i64>,
  transfer_name: Option<String>,
  filename:      Option<String>,
}

const PAGE_SQL: &str = "
  SELECT m.ROWID, m.guid, m.text, m.attributedBody, m.service, m.date, m.date_delivered,
         m.is_from_me, m.destination_caller_id, m.subject, h.id,
         (SELECT cmj.chat_id FROM chat_message_join cmj
           WHERE cmj.message_id = m.ROWID ORDER BY cmj.chat_id LIMIT 1)
  FROM message m
  LEFT JOIN handle h ON h.ROWID = m.handle_id
  WHERE m.ROWID > ?1
  ORDER BY m.ROWID
  LIMIT ?2";

fn read_page(
  conn: &rusqlite::Connection,
  after: i64,
  limit: i64,
) -> rusqlite::Result<Vec<MessageRow>> {
  let mut messages = conn.prepare_cached(PAGE_SQL)?;
  let mut rows = messages
    .query_map(rusqlite::params![after, limit], |r| {
      Ok(MessageRow {
        rowid:                 r.get(0)?,
        guid:                  r.get(1)?,
        text:                  r.get(2)?,
        attributed_body:       r.get(3)?,
        service:               r.get(4)?,
        date:                  r.get::<_, Option<i64>>(5)?.unwrap_or(0),
        date_delivered:        r.get(6)?,
        is_from_me:            r.get::<_, Option<i64>>(7)?.unwrap_or(0) != 0,
        destination_caller_id: r.get(8)?,
        subject:               r.get(9)?,
        handle:                r.get(10)?,
        chat_id:               r.get(11)?,
        chat_guid:             None,
        chat_handles:          Vec::new(),
        attachments:           Vec::new(),
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut chat_guid = conn.prepare_cached("SELECT guid FROM chat WHERE ROWID = ?1")?;
  let mut chat_handles = conn.prepare_cached(
    "SELECT h.id FROM chat_handle_join chj JOIN handle h ON h.ROWID = chj.handle_id
     WHERE chj.chat_id = ?1 ORDER BY h.id",
  )?;
  let mut attachments = conn.prepare_cached(
    "SELECT a.ROWID, a.guid, a.mime_type, a.total_bytes, a.transfer_name, a.filename
     FROM message_attachment_join maj JOIN attachment a ON a.ROWID = maj.attachment_id
     WHERE maj.message_id = ?1 ORDER BY a.ROWID",
  )?;

  let mut chats: HashMap<i64, (Option<String>, Vec<String>)> = HashMap::new();
  for row in &mut rows {
    if let Some(chat_id) = row.chat_id {
      if !chats.contains_key(&chat_id) {
        let guid: Option<String> = chat_guid
          .query_row(rusqlite::params![chat_id], |r| r.get(0))
          .optional()?
          .flatten();
        let handles = chat_handles
          .query_map(rusqlite::params![chat_id], |r| r.get::<_, String>(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        chats.insert(chat_id, (guid, handles));
      }
      if let Some((guid, handles)) = chats.get(&chat_id) {
        row.chat_guid = guid.clone();
        row.chat_handles = handles.clone();
      }
    }

    row.attachments = attachments
      .query_map(rusqlite::params![row.rowid], |r| {
        Ok(AttachmentRow {
          rowid:         r.get(0)?,
          guid:          r.get(1)?,
          mime_type:     r.get(2)?,
          total_bytes:   r.get(3)?,
          transfer_name: r.get(4)?,
          filename:      r.get(5)?,
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
  }

  Ok(rows)
}

impl MessageRow {
  fn into_record(self, source: SourceKind) -> RawRecord {
    let external_id = self.guid.unwrap_or_else(|| format!("{ROWID_PREFIX}{}", self.rowid));
    let mut record = RawRecord::new(source, external_id, apple_time(self.date));

    record.conversation_id = self.chat_guid;
    record.channel = Channel::from_service(self.service.as_deref());
    record.received_at = self.date_delivered.filter(|d| *d != 0).map(apple_time);
    record.subject = self.subject.filter(|s| !s.trim().is_empty());
    record.raw_body = self.text;
    record.raw_rich_text_blob = self.attributed_body.filter(|b| !b.is_empty());

    let mut recipients = self.chat_handles;
    if self.is_from_me {
      record.direction = Direction::Outbound;
      record.sender = self.destination_caller_id;
      recipients.extend(self.handle);
    } else {
      record.direction = Direction::Inbound;
      record.sender = self.handle;
      recipients.extend(self.destination_caller_id);
    }
    record.recipients = recipients;

    record.attachment_refs = self
      .attachments
      .into_iter()
      .filter(|a| a.filename.is_some())
      .map(|a| AttachmentRef {
        external_id: a.guid.unwrap_or_else(|| format!("{ROWID_PREFIX}{}", a.rowid)),
        filename:    a.transfer_name.or_else(|| {
          a.filename
            .as_deref()
            .and_then(|f| Path::new(f).file_name())
            .map(|n| n.to_string_lossy().into_owned())
        }),
        mime_type:   a.mime_type,
        size_hint:   a.total_bytes.and_then(|n| u64::try_from(n).ok()).filter(|n| *n > 0),
      })
      .collect();

    record
  }
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

pub struct MessageDbSource {
  conn:        tokio_rusqlite::Connection,
  kind:        SourceKind,
  attachments: AttachmentResolver,
  page_size:   usize,
}

impl MessageDbSource {
  /// Open a local message store. `~/…` attachment paths resolve under
  /// `home`.
  pub async fn open(path: impl AsRef<Path>, home: impl Into<PathBuf>) -> Result<Self, SourceError> {
    Self::open_with(path.as_ref(), SourceKind::Messages, AttachmentResolver::Home(home.into())).await
  }

  pub(crate) async fn open_with(
    path: &Path,
    kind: SourceKind,
    attachments: AttachmentResolver,
  ) -> Result<Self, SourceError> {
    let conn = open_read_only(path).await?;
    Ok(Self { conn, kind, attachments, page_size: DEFAULT_PAGE_SIZE })
  }

  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  async fn attachment_filename(&self, external_id: &str) -> Result<Option<String>, SourceError> {
    let id = external_id.to_owned();
    let filename = self
      .conn
      .call(move |conn| {
        let found = match id.strip_prefix(ROWID_PREFIX).and_then(|n| n.parse::<i64>().ok()) {
          Some(rowid) => conn
            .query_row(
              "SELECT filename FROM attachment WHERE ROWID = ?1",
              rusqlite::params![rowid],
              |r| r.get::<_, Option<String>>(0),
            )
            .optional()?,
          None => conn
            .query_row(
              "SELECT filename FROM attachment WHERE guid = ?1",
              rusqlite::params![id],
              |r| r.get::<_, Option<String>>(0),
            )
            .optional()?,
        };
        Ok(found.flatten())
      })
      .await?;
    Ok(filename)
  }
}

/// Open an existing SQLite file read-only on its own connection.
pub(crate) async fn open_read_only(path: &Path) -> Result<tokio_rusqlite::Connection, SourceError> {
  if !tokio::fs::try_exists(path).await.unwrap_or(false) {
    return Err(SourceError::Unavailable(format!("{} not found", path.display())));
  }
  let conn = tokio_rusqlite::Connection::open_with_flags(
    path,
    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
  )
  .await
  .map_err(|e| SourceError::Unavailable(format!("{}: {e}", path.display())))?;
  Ok(conn)
}

impl SourceAdapter for MessageDbSource {
  fn kind(&self) -> SourceKind { self.kind }

  async fn fetch_raw_records(&self, cursor: Option<&str>) -> Result<Page, SourceError> {
    let after = match cursor {
      None => 0,
      Some(c) => c
        .parse::<i64>()
        .map_err(|_| SourceError::Parse(format!("invalid message cursor {c:?}")))?,
    };
    let limit = i64::try_from(self.page_size).unwrap_or(i64::MAX);

    let rows = self
      .conn
      .call(move |conn| Ok(read_page(conn, after, limit)?))
      .await?;

    let next_cursor = (rows.len() >= self.page_size)
      .then(|| rows.last().map(|r| r.rowid.to_string()))
      .flatten();
    let records: Vec<RawRecord> = rows.into_iter().map(|r| r.into_record(self.kind)).collect();

    tracing::debug!(
      source = %self.kind,
      after,
      records = records.len(),
      more = next_cursor.is_some(),
      "message store page read"
    );
    Ok(Page { records, next_cursor })
  }

  async fn attachment_bytes(&self, external_attachment_id: &str) -> Result<Bytes, SourceError> {
    let filename = self
      .attachment_filename(external_attachment_id)
      .await?
      .ok_or_else(|| SourceError::AttachmentNotFound(external_attachment_id.to_owned()))?;
    let path = self.attachments.resolve(&filename).await?;

    match tokio::fs::read(&path).await {
      Ok(bytes) => Ok(Bytes::from(bytes)),
      Err(e) if e.kind() == ErrorKind::NotFound => {
        Err(SourceError::AttachmentNotFound(path.display().to_string()))
      }
      Err(e) => Err(e.into()),
    }
  }
}

// ─── Test fixtures ───────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::{fixtures::ChatDb, *};

  #[test]
  fn apple_time_accepts_seconds_and_nanoseconds() {
    let expected = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
    let secs = expected.timestamp() - APPLE_EPOCH_OFFSET;
    assert_eq!(apple_time(secs), expected);
    assert_eq!(apple_time(secs * 1_000_000_000), expected);
    assert_eq!(apple_time(0), Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap());
  }

  #[test]
  fn device_paths_become_manifest_paths() {
    assert_eq!(
      device_relative_path("~/Library/SMS/Attachments/ab/01/IMG_1.jpg"),
      "Library/SMS/Attachments/ab/01/IMG_1.jpg"
    );
    assert_eq!(
      device_relative_path("/var/mobile/Library/SMS/Attachments/x.jpg"),
      "Library/SMS/Attachments/x.jpg"
    );
  }

  #[test]
  fn home_expansion() {
    let home = Path::new("/home/u");
    assert_eq!(expand_home("~/a/b.jpg", home), PathBuf::from("/home/u/a/b.jpg"));
    assert_eq!(expand_home("/abs/b.jpg", home), PathBuf::from("/abs/b.jpg"));
  }

  #[tokio::test]
  async fn pages_follow_rowid_and_carry_participants() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.db");
    let db = ChatDb::create(&path);
    db.handle(1, "+1 (415) 555-0100");
    db.handle(2, "bob@example.com");
    db.chat(10, "iMessage;+;chat-group", &[1, 2]);
    db.message(1, "g1", Some("hello all"), None, 1, Some(10), false, 700_000_000);
    db.message(2, "g2", Some("hi"), None, 0, Some(10), true, 700_000_100);
    db.message(3, "g3", None, None, 2, None, false, 700_000_200);
    drop(db);

    let source = MessageDbSource::open(&path, dir.path()).await.unwrap().with_page_size(2);

    let first = source.fetch_raw_records(None).await.unwrap();
    assert_eq!(first.records.len(), 2);
    assert_eq!(first.next_cursor.as_deref(), Some("2"));

    let inbound = &first.records[0];
    assert_eq!(inbound.external_id, "g1");
    assert_eq!(inbound.source, SourceKind::Messages);
    assert_eq!(inbound.conversation_id.as_deref(), Some("iMessage;+;chat-group"));
    assert_eq!(inbound.direction, Direction::Inbound);
    assert_eq!(inbound.channel, Channel::IMessage);
    assert_eq!(inbound.sender.as_deref(), Some("+1 (415) 555-0100"));
    assert!(inbound.recipients.contains(&"owner@example.com".to_owned()));
    assert!(inbound.recipients.contains(&"bob@example.com".to_owned()));

    let outbound = &first.records[1];
    assert_eq!(outbound.direction, Direction::Outbound);
    assert_eq!(outbound.sender.as_deref(), Some("owner@example.com"));

    let second = source.fetch_raw_records(first.next_cursor.as_deref()).await.unwrap();
    assert_eq!(second.records.len(), 1);
    assert!(second.next_cursor.is_none());
    assert_eq!(second.records[0].conversation_id, None);
    assert_eq!(second.records[0].raw_body, None);
  }

  #[tokio::test]
  async fn attachments_resolve_under_home() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.db");
    std::fs::create_dir_all(dir.path().join("Library/Messages/Attachments")).unwrap();
    std::fs::write(dir.path().join("Library/Messages/Attachments/IMG_1.jpg"), b"jpeg bytes").unwrap();

    let db = ChatDb::create(&path);
    db.handle(1, "4155550100");
    db.message(1, "g1", None, None, 1, None, false, 1);
    db.attachment(1, 5, "att-guid", "~/Library/Messages/Attachments/IMG_1.jpg", 10);
    drop(db);

    let source = MessageDbSource::open(&path, dir.path()).await.unwrap();
    let page = source.fetch_raw_records(None).await.unwrap();
    let att = &page.records[0].attachment_refs[0];
    assert_eq!(att.external_id, "att-guid");
    assert_eq!(att.filename.as_deref(), Some("IMG_1.jpg"));
    assert_eq!(att.size_hint, Some(10));

    let bytes = source.attachment_bytes("att-guid").await.unwrap();
    assert_eq!(&bytes[..], b"jpeg bytes");

    assert!(matches!(
      source.attachment_bytes("nope").await,
      Err(SourceError::AttachmentNotFound(_))
    ));
  }

  #[tokio::test]
  async fn missing_store_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let result = MessageDbSource::open(dir.path().join("absent.db"), dir.path()).await;
    assert!(matches!(result, Err(SourceError::Unavailable(_))));
  }

  #[tokio::test]
  async fn bad_cursor_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.db");
    drop(ChatDb::create(&path));
    let source = MessageDbSource::open(&path, dir.path()).await.unwrap();
    assert!(matches!(
      source.fetch_raw_records(Some("abc")).await,
      Err(SourceError::Parse(_))
    ));
  }
}

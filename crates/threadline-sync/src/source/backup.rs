//! Unencrypted device backup reader.
//!
//! A backup directory stores every file under `<id[0..2]>/<id>`, with
//! `Manifest.db` mapping `(domain, relativePath)` to the id. The message
//! store is `HomeDomain` / `Library/SMS/sms.db`; attachments are
//! `MediaDomain` files. Record decoding is the same as for a local store.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use rusqlite::OptionalExtension as _;
use threadline_core::record::SourceKind;

use super::{
  Page, SourceAdapter, SourceError,
  message_db::{AttachmentResolver, MessageDbSource, open_read_only},
};

const MANIFEST_FILE: &str = "Manifest.db";
const MESSAGE_STORE_DOMAIN: &str = "HomeDomain";
const MESSAGE_STORE_PATH: &str = "Library/SMS/sms.db";

/// On-disk location of a manifest file id.
pub fn manifest_file_path(root: &Path, file_id: &str) -> PathBuf {
  let shard = file_id.get(..2).unwrap_or(file_id);
  root.join(shard).join(file_id)
}

pub struct DeviceBackupSource {
  root:  PathBuf,
  inner: MessageDbSource,
}

impl DeviceBackupSource {
  pub async fn open(root: impl Into<PathBuf>) -> Result<Self, SourceError> {
    let root = root.into();
    let manifest = open_read_only(&root.join(MANIFEST_FILE)).await?;

    let file_id: Option<String> = manifest
      .call(|conn| {
        Ok(
          conn
            .query_row(
              "SELECT fileID FROM Files WHERE domain = ?1 AND relativePath = ?2",
              rusqlite::params![MESSAGE_STORE_DOMAIN, MESSAGE_STORE_PATH],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await
      .map_err(|e| SourceError::Unavailable(format!("unreadable backup manifest: {e}")))?;

    let file_id = file_id.ok_or_else(|| {
      SourceError::Unavailable(format!("{} has no message store", root.display()))
    })?;
    let store_path = manifest_file_path(&root, &file_id);
    tracing::debug!(backup = %root.display(), store = %store_path.display(), "backup message store located");

    let inner = MessageDbSource::open_with(
      &store_path,
      SourceKind::Backup,
      AttachmentResolver::Manifest { root: root.clone(), manifest },
    )
    .await?;
    Ok(Self { root, inner })
  }

  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.inner = self.inner.with_page_size(page_size);
    self
  }

  pub fn root(&self) -> &Path { &self.root }
}

impl SourceAdapter for DeviceBackupSource {
  fn kind(&self) -> SourceKind { SourceKind::Backup }

  async fn fetch_raw_records(&self, cursor: Option<&str>) -> Result<Page, SourceError> {
    self.inner.fetch_raw_records(cursor).await
  }

  async fn attachment_bytes(&self, external_attachment_id: &str) -> Result<Bytes, SourceError> {
    self.inner.attachment_bytes(external_attachment_id).await
  }
}

#[cfg(test)]
pub(crate) mod fixtures {
  use std::path::Path;

  use super::manifest_file_path;
  use crate::source::message_db::fixtures::ChatDb;

  pub const SMS_DB_ID: &str = "3d0d7e5fb2ce288813306e4d4636395e047a3d28";

  pub struct Backup {
    pub manifest: rusqlite::Connection,
  }

  impl Backup {
    /// A backup at `root` whose message store is returned for seeding.
    pub fn create(root: &Path) -> (Self, ChatDb) {
      let manifest = rusqlite::Connection::open(root.join("Manifest.db")).unwrap();
      manifest
        .execute_batch(
          "CREATE TABLE Files (fileID TEXT PRIMARY KEY, domain TEXT, relativePath TEXT, flags INTEGER, file BLOB);",
        )
        .unwrap();
      manifest
        .execute(
          "INSERT INTO Files (fileID, domain, relativePath, flags) VALUES (?1, 'HomeDomain', 'Library/SMS/sms.db', 1)",
          rusqlite::params![SMS_DB_ID],
        )
        .unwrap();

      let store_path = manifest_file_path(root, SMS_DB_ID);
      std::fs::create_dir_all(store_path.parent().unwrap()).unwrap();
      (Self { manifest }, ChatDb::create(&store_path))
    }

    pub fn media_file(&self, root: &Path, file_id: &str, relative_path: &str, bytes: &[u8]) {
      self
        .manifest
        .execute(
          "INSERT INTO Files (fileID, domain, relativePath, flags) VALUES (?1, 'MediaDomain', ?2, 1)",
          rusqlite::params![file_id, relative_path],
        )
        .unwrap();
      let path = manifest_file_path(root, file_id);
      std::fs::create_dir_all(path.parent().unwrap()).unwrap();
      std::fs::write(path, bytes).unwrap();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{fixtures::Backup, *};

  #[test]
  fn file_ids_are_sharded() {
    assert_eq!(
      manifest_file_path(Path::new("/b"), "abcdef"),
      PathBuf::from("/b/ab/abcdef")
    );
  }

  #[tokio::test]
  async fn reads_messages_and_media_through_the_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let (backup, db) = Backup::create(dir.path());
    db.handle(1, "+44 20 7946 0958");
    db.chat(3, "SMS;-;+442079460958", &[1]);
    db.message(1, "b1", Some("from the backup"), None, 1, Some(3), false, 10);
    db.attachment(1, 1, "att-1", "~/Library/SMS/Attachments/0a/10/IMG_2.jpg", 4);
    backup.media_file(dir.path(), "ffee00", "Library/SMS/Attachments/0a/10/IMG_2.jpg", b"\x01\x02\x03\x04");
    drop(db);
    drop(backup);

    let source = DeviceBackupSource::open(dir.path()).await.unwrap();
    assert_eq!(source.kind(), SourceKind::Backup);

    let page = source.fetch_raw_records(None).await.unwrap();
    assert_eq!(page.records.len(), 1);
    let record = &page.records[0];
    assert_eq!(record.source, SourceKind::Backup);
    assert_eq!(record.external_id, "b1");
    assert_eq!(record.conversation_id.as_deref(), Some("SMS;-;+442079460958"));

    let bytes = source.attachment_bytes("att-1").await.unwrap();
    assert_eq!(&bytes[..], b"\x01\x02\x03\x04");
  }

  #[tokio::test]
  async fn unknown_media_path_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (backup, db) = Backup::create(dir.path());
    db.handle(1, "4155550100");
    db.message(1, "b1", None, None, 1, None, false, 10);
    db.attachment(1, 1, "att-1", "~/Library/SMS/Attachments/missing.jpg", 4);
    drop(db);
    drop(backup);

    let source = DeviceBackupSource::open(dir.path()).await.unwrap();
    assert!(matches!(
      source.attachment_bytes("att-1").await,
      Err(SourceError::AttachmentNotFound(_))
    ));
  }

  #[tokio::test]
  async fn directory_without_manifest_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      DeviceBackupSource::open(dir.path()).await,
      Err(SourceError::Unavailable(_))
    ));
  }
}

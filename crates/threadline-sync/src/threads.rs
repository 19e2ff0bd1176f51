//! Thread views computed from stored communications.

use threadline_core::{store::CommunicationStore, thread::Thread};

use crate::{Error, Result};

/// The thread `thread_id`, or `None` when no communication carries it.
pub async fn load_thread<S: CommunicationStore>(
  store: &S,
  user_id: &str,
  thread_id: &str,
) -> Result<Option<Thread>> {
  let communications = store
    .communications_in_thread(user_id, thread_id)
    .await
    .map_err(Error::storage)?;
  if communications.is_empty() {
    return Ok(None);
  }
  Ok(Some(Thread::from_communications(thread_id, &communications)))
}

/// More than two distinct participants across the whole thread.
pub async fn is_group_thread<S: CommunicationStore>(
  store: &S,
  user_id: &str,
  thread_id: &str,
) -> Result<bool> {
  Ok(load_thread(store, user_id, thread_id).await?.is_some_and(|t| t.is_group))
}

/// Every thread of `user_id`, most recently active first.
pub async fn list_threads<S: CommunicationStore>(store: &S, user_id: &str) -> Result<Vec<Thread>> {
  let ids = store.list_thread_ids(user_id).await.map_err(Error::storage)?;
  let mut threads = Vec::with_capacity(ids.len());
  for id in ids {
    if let Some(thread) = load_thread(store, user_id, &id).await? {
      threads.push(thread);
    }
  }
  threads.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
  Ok(threads)
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};
  use threadline_core::{
    communication::{ChunkWrite, NewCommunication},
    record::{Channel, Direction, SourceKind},
  };
  use threadline_store_sqlite::SqliteStore;

  use super::*;

  fn comm(id: &str, thread: &str, participants: &[&str], secs: i64) -> NewCommunication {
    NewCommunication {
      external_id:  id.into(),
      channel:      Channel::Email,
      direction:    Direction::Inbound,
      participants: participants.iter().map(|s| (*s).to_owned()).collect(),
      thread_id:    thread.into(),
      subject:      None,
      body_text:    String::new(),
      sent_at:      Utc.timestamp_opt(secs, 0).unwrap(),
    }
  }

  #[tokio::test]
  async fn group_classification_uses_the_whole_thread() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let mut write = ChunkWrite::new("u", SourceKind::Mail);
    write.communications = vec![
      comm("1", "group", &["a@example.com", "b@example.com"], 10),
      comm("2", "group", &["a@example.com", "c@example.com"], 30),
      comm("3", "pair", &["a@example.com", "b@example.com"], 20),
    ];
    store.commit_chunk(write).await.unwrap();

    assert!(is_group_thread(&store, "u", "group").await.unwrap());
    assert!(!is_group_thread(&store, "u", "pair").await.unwrap());
    assert!(!is_group_thread(&store, "u", "absent").await.unwrap());

    let threads = list_threads(&store, "u").await.unwrap();
    let keys: Vec<_> = threads.iter().map(|t| t.thread_key.as_str()).collect();
    assert_eq!(keys, vec!["group", "pair"]);
    assert_eq!(threads[0].participants_flat(), "a@example.com,b@example.com,c@example.com");
  }
}

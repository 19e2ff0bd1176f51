//! SQLite backend for the threadline datastore.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated
//! connection thread without blocking the async runtime. The file is opened in
//! WAL mode: one writer (the active sync) and any number of readers.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

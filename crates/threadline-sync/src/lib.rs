//! Ingestion pipeline for threadline.
//!
//! A [`SyncEngine`] pulls pages of [`RawRecord`](threadline_core::record::RawRecord)s
//! from a [`SourceAdapter`], drops the ones already stored, and processes the
//! rest in cooperative chunks: text extraction, identity normalization,
//! thread keys and attachment dedup, then one atomic
//! [`commit_chunk`](threadline_core::store::CommunicationStore::commit_chunk)
//! per chunk. Network sources go through a [`RateLimitedClient`].
//!
//! [`AutoLinkEngine`] runs separately and associates stored communications
//! with business transactions.

#![allow(async_fn_in_trait)]

pub mod autolink;
pub mod chunk;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod ratelimit;
pub mod source;
pub mod threads;

pub use autolink::{AutoLinkEngine, AutoLinkReport, LinkScope};
pub use chunk::{ChunkOptions, ChunkProgress, process_in_chunks};
pub use dedup::{AttachmentStore, DEFAULT_MAX_ATTACHMENT_BYTES};
pub use engine::{
  FailureKind, SyncEngine, SyncHandle, SyncOptions, SyncPhase, SyncProgress, SyncReport, SyncStatus,
  sync_all,
};
pub use error::{Error, Result};
pub use ratelimit::{RateLimitedClient, RetryPolicy, TokenBucket};
pub use source::{Page, Source, SourceAdapter, SourceError};
pub use threads::{is_group_thread, list_threads, load_thread};

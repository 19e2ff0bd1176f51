//! Cooperative batch execution.
//!
//! [`process_in_chunks`] splits its input into fixed-size chunks and hands
//! each to a transform that is expected to commit the chunk's side effects
//! before returning. Control goes back to the scheduler after every chunk,
//! and a [`Yielder`] lets the transform yield at a finer grain inside one.
//! Cancellation is observed at every yield point.

use std::future::Future;

use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHUNK_SIZE: usize = 250;
pub const DEFAULT_YIELD_EVERY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
  /// Items per chunk; values below 1 are treated as 1.
  pub chunk_size:     usize,
  /// Sub-items between yields inside a chunk.
  pub yield_every:    usize,
  /// Completed chunks between progress callbacks.
  pub progress_every: usize,
}

impl Default for ChunkOptions {
  fn default() -> Self {
    Self {
      chunk_size:     DEFAULT_CHUNK_SIZE,
      yield_every:    DEFAULT_YIELD_EVERY,
      progress_every: 1,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
  pub current: usize,
  pub total:   usize,
}

/// What a transform did with its chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStep<R> {
  /// Side effects are durable.
  Committed(R),
  /// Cancellation was observed before commit; nothing was written.
  Abandoned,
}

/// Returned by [`Yielder::tick`] once cancellation has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Fine-grained yield point handed to each chunk's transform.
#[derive(Debug, Clone)]
pub struct Yielder {
  every:       usize,
  since_yield: usize,
  cancel:      CancellationToken,
}

impl Yielder {
  fn new(every: usize, cancel: CancellationToken) -> Self {
    Self { every: every.max(1), since_yield: 0, cancel }
  }

  /// Count one sub-item, yielding to the scheduler every `yield_every`
  /// calls.
  pub async fn tick(&mut self) -> Result<(), Cancelled> {
    self.since_yield += 1;
    if self.since_yield >= self.every {
      self.since_yield = 0;
      tokio::task::yield_now().await;
    }
    self.check()
  }

  /// Non-yielding cancellation check, for use right before a commit.
  pub fn check(&self) -> Result<(), Cancelled> {
    if self.cancel.is_cancelled() { Err(Cancelled) } else { Ok(()) }
  }
}

/// Every chunk that committed, in order.
#[derive(Debug)]
pub struct ChunkRun<R> {
  pub results:   Vec<R>,
  /// Items in committed chunks.
  pub processed: usize,
  pub total:     usize,
  pub cancelled: bool,
}

/// A transform failed. `completed` holds the chunks committed before it.
#[derive(Debug)]
pub struct ChunkFailure<R, E> {
  pub completed: Vec<R>,
  pub processed: usize,
  pub error:     E,
}

/// Run `transform` over `items` in chunks of `options.chunk_size`.
///
/// `on_progress` fires every `options.progress_every` committed chunks and
/// once on completion. On cancellation the returned run contains exactly the
/// chunks committed so far.
pub async fn process_in_chunks<T, R, E, F, Fut, P>(
  items: Vec<T>,
  options: ChunkOptions,
  mut transform: F,
  mut on_progress: P,
  cancel: &CancellationToken,
) -> Result<ChunkRun<R>, ChunkFailure<R, E>>
where
  F: FnMut(Vec<T>, Yielder) -> Fut,
  Fut: Future<Output = Result<ChunkStep<R>, E>>,
  P: FnMut(ChunkProgress),
{
  let total = items.len();
  let chunk_size = options.chunk_size.max(1);
  let progress_every = options.progress_every.max(1);

  let mut results = Vec::new();
  let mut processed = 0;
  let mut iter = items.into_iter();

  loop {
    if cancel.is_cancelled() {
      return Ok(ChunkRun { results, processed, total, cancelled: true });
    }

    let chunk: Vec<T> = iter.by_ref().take(chunk_size).collect();
    if chunk.is_empty() {
      break;
    }
    let len = chunk.len();

    match transform(chunk, Yielder::new(options.yield_every, cancel.clone())).await {
      Ok(ChunkStep::Committed(result)) => {
        results.push(result);
        processed += len;
      }
      Ok(ChunkStep::Abandoned) => {
        tracing::debug!(processed, total, "chunk abandoned on cancellation");
        return Ok(ChunkRun { results, processed, total, cancelled: true });
      }
      Err(error) => {
        return Err(ChunkFailure { completed: results, processed, error });
      }
    }

    if results.len() % progress_every == 0 && processed < total {
      on_progress(ChunkProgress { current: processed, total });
    }
    tokio::task::yield_now().await;
  }

  on_progress(ChunkProgress { current: processed, total });
  Ok(ChunkRun { results, processed, total, cancelled: false })
}

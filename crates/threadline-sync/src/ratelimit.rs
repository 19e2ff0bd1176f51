//! Token-bucket rate limiting with retry for third-party API calls.
//!
//! Every call made through a [`RateLimitedClient`] first takes a token from
//! its [`TokenBucket`], then runs. Failures are classified by the caller into
//! [`ApiFailure`]; rate-limited and transient failures are retried with
//! exponential backoff (or the server's explicit delay), while fatal ones
//! surface immediately.

use std::{fmt, future::Future, sync::Mutex, time::Duration};

use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

// ─── TokenBucket ─────────────────────────────────────────────────────────────

/// Slack for float accumulation when checking whether a whole token is
/// available.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct BucketState {
  tokens:      f64,
  last_refill: Instant,
}

/// Continuous-refill token bucket.
///
/// Capacity equals the per-minute rate and the bucket starts full, so a
/// burst of `requests_per_minute` calls is granted at once and every further
/// call waits for `60000 / rpm` ms worth of refill.
#[derive(Debug)]
pub struct TokenBucket {
  capacity:      f64,
  refill_per_ms: f64,
  state:         Mutex<BucketState>,
}

impl TokenBucket {
  pub fn new(requests_per_minute: u32) -> Self {
    let rpm = f64::from(requests_per_minute.max(1));
    Self {
      capacity:      rpm,
      refill_per_ms: rpm / 60_000.0,
      state:         Mutex::new(BucketState { tokens: rpm, last_refill: Instant::now() }),
    }
  }

  pub fn requests_per_minute(&self) -> u32 { self.capacity as u32 }

  /// Take a token if one is available right now.
  pub fn try_acquire(&self) -> bool { self.take_or_wait().is_none() }

  /// Wait until a token is available and take it. Returns how long the
  /// caller waited.
  pub async fn acquire(&self) -> Duration {
    let start = Instant::now();
    while let Some(wait) = self.take_or_wait() {
      tokio::time::sleep(wait).await;
    }
    start.elapsed()
  }

  /// Take a token, or report how long until one is available.
  fn take_or_wait(&self) -> Option<Duration> {
    let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let now = Instant::now();
    let elapsed_ms = now.duration_since(state.last_refill).as_secs_f64() * 1000.0;
    state.tokens = (state.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
    state.last_refill = now;

    if state.tokens >= 1.0 - TOKEN_EPSILON {
      state.tokens = (state.tokens - 1.0).max(0.0);
      None
    } else {
      let wait_ms = (1.0 - state.tokens) / self.refill_per_ms;
      Some(Duration::from_secs_f64(wait_ms / 1000.0))
    }
  }
}

// ─── RetryPolicy ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  /// Total tries, including the first.
  pub max_attempts: u32,
  pub base_delay:   Duration,
  pub multiplier:   f64,
  pub max_delay:    Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay:   Duration::from_millis(500),
      multiplier:   2.0,
      max_delay:    Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  /// Delay after the `attempt`-th failure (1-based):
  /// `base * multiplier^(attempt-1)`, capped at `max_delay`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
    if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
      return self.max_delay;
    }
    Duration::from_secs_f64(secs.max(0.0))
  }
}

// ─── Failure classification ──────────────────────────────────────────────────

/// How a failed call should be treated.
#[derive(Debug)]
pub enum ApiFailure<E> {
  /// "Too many requests". `retry_after` is honoured verbatim when present.
  RateLimited { retry_after: Option<Duration>, error: E },
  /// Server errors and timeouts; retried with computed backoff.
  Transient(E),
  /// Invalid credentials, exhausted quota, other client errors.
  Fatal(E),
}

impl<E> ApiFailure<E> {
  pub fn into_inner(self) -> E {
    match self {
      Self::RateLimited { error, .. } | Self::Transient(error) | Self::Fatal(error) => error,
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError<E: std::error::Error + 'static> {
  #[error(transparent)]
  Fatal(E),

  #[error("gave up after {attempts} attempts: {last}")]
  Exhausted {
    attempts:     u32,
    rate_limited: bool,
    #[source]
    last:         E,
  },

  #[error("cancelled")]
  Cancelled,
}

// ─── RateLimitedClient ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
  Idle,
  Acquiring,
  Executing,
  Backoff,
  Succeeded,
  Failed,
}

impl fmt::Display for CallState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Idle => "idle",
      Self::Acquiring => "acquiring",
      Self::Executing => "executing",
      Self::Backoff => "backoff",
      Self::Succeeded => "succeeded",
      Self::Failed => "failed",
    })
  }
}

pub struct RateLimitedClient {
  bucket: TokenBucket,
  policy: RetryPolicy,
  state:  watch::Sender<CallState>,
  cancel: CancellationToken,
}

impl RateLimitedClient {
  pub fn new(requests_per_minute: u32, policy: RetryPolicy) -> Self {
    Self {
      bucket: TokenBucket::new(requests_per_minute),
      policy,
      state: watch::Sender::new(CallState::Idle),
      cancel: CancellationToken::new(),
    }
  }

  /// Abort token waits and backoff sleeps when `cancel` fires.
  pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn state(&self) -> CallState { *self.state.borrow() }

  /// Observe state transitions.
  pub fn subscribe(&self) -> watch::Receiver<CallState> { self.state.subscribe() }

  pub fn bucket(&self) -> &TokenBucket { &self.bucket }

  pub fn policy(&self) -> &RetryPolicy { &self.policy }

  /// Run `op` under the limiter and retry policy.
  ///
  /// `Acquiring → Executing → {Succeeded | Backoff | Failed}`, with
  /// `Backoff → Acquiring` once the delay elapses.
  pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, CallError<E>>
  where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiFailure<E>>>,
  {
    let attempts = self.policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
      self.set(CallState::Acquiring);
      tokio::select! {
        biased;
        _ = self.cancel.cancelled() => return self.fail(CallError::Cancelled),
        waited = self.bucket.acquire() => {
          if !waited.is_zero() {
            tracing::trace!(waited_ms = waited.as_millis() as u64, "rate limiter token acquired");
          }
        }
      }

      self.set(CallState::Executing);
      attempt += 1;

      let (delay, rate_limited, error) = match op().await {
        Ok(value) => {
          self.set(CallState::Succeeded);
          return Ok(value);
        }
        Err(ApiFailure::Fatal(error)) => return self.fail(CallError::Fatal(error)),
        Err(ApiFailure::RateLimited { retry_after, error }) => {
          (retry_after.unwrap_or_else(|| self.policy.backoff(attempt)), true, error)
        }
        Err(ApiFailure::Transient(error)) => (self.policy.backoff(attempt), false, error),
      };

      if attempt >= attempts {
        tracing::warn!(attempts, %error, "retries exhausted");
        return self.fail(CallError::Exhausted { attempts, rate_limited, last: error });
      }

      tracing::warn!(
        attempt,
        attempts,
        rate_limited,
        delay_ms = delay.as_millis() as u64,
        %error,
        "api call failed; backing off"
      );
      self.set(CallState::Backoff);
      tokio::select! {
        biased;
        _ = self.cancel.cancelled() => return self.fail(CallError::Cancelled),
        _ = tokio::time::sleep(delay) => {}
      }
    }
  }

  fn set(&self, state: CallState) { self.state.send_replace(state); }

  fn fail<T, E: std::error::Error + 'static>(&self, e: CallError<E>) -> Result<T, CallError<E>> {
    self.set(CallState::Failed);
    Err(e)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
  };

  use super::*;

  #[derive(Debug, thiserror::Error)]
  #[error("{0}")]
  struct TestError(&'static str);

  fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      base_delay: Duration::from_millis(100),
      multiplier: 2.0,
      max_delay: Duration::from_secs(1),
    }
  }

  // ── TokenBucket ───────────────────────────────────────────────────────────

  #[tokio::test(start_paused = true)]
  async fn sixty_first_call_waits_about_a_second() {
    let bucket = TokenBucket::new(60);
    for _ in 0..60 {
      assert_eq!(bucket.acquire().await, Duration::ZERO);
    }
    let waited = bucket.acquire().await;
    assert!(
      waited >= Duration::from_millis(990) && waited <= Duration::from_millis(1010),
      "waited {waited:?}"
    );
  }

  #[tokio::test(start_paused = true)]
  async fn try_acquire_never_blocks() {
    let bucket = TokenBucket::new(2);
    assert!(bucket.try_acquire());
    assert!(bucket.try_acquire());
    assert!(!bucket.try_acquire());

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(bucket.try_acquire());
    assert!(!bucket.try_acquire());
  }

  #[tokio::test(start_paused = true)]
  async fn grants_never_outpace_the_rate() {
    // With R = 6/min, at most R + t*R/60s grants can have happened by time t.
    let rpm = 6;
    let bucket = TokenBucket::new(rpm);
    let start = Instant::now();
    for n in 1..=20u32 {
      bucket.acquire().await;
      let elapsed_ms = start.elapsed().as_millis() as f64;
      let allowed = f64::from(rpm) + elapsed_ms * f64::from(rpm) / 60_000.0;
      assert!(f64::from(n) <= allowed + 1e-6, "grant {n} at {elapsed_ms}ms");
    }
    // 14 grants beyond the initial burst at 10 s each.
    assert!(start.elapsed() >= Duration::from_secs(140) - Duration::from_millis(10));
  }

  #[tokio::test(start_paused = true)]
  async fn refill_does_not_exceed_capacity() {
    let bucket = TokenBucket::new(3);
    tokio::time::advance(Duration::from_secs(3600)).await;
    for _ in 0..3 {
      assert!(bucket.try_acquire());
    }
    assert!(!bucket.try_acquire());
  }

  // ── RetryPolicy ───────────────────────────────────────────────────────────

  #[test]
  fn backoff_grows_and_caps() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.backoff(1), Duration::from_millis(500));
    assert_eq!(policy.backoff(2), Duration::from_millis(1000));
    assert_eq!(policy.backoff(3), Duration::from_millis(2000));
    assert_eq!(policy.backoff(20), Duration::from_secs(30));
    assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
  }

  // ── RateLimitedClient ─────────────────────────────────────────────────────

  #[tokio::test(start_paused = true)]
  async fn retries_rate_limited_then_succeeds() {
    let client = RateLimitedClient::new(600, fast_policy(3));
    let calls = Arc::new(AtomicU32::new(0));

    let start = Instant::now();
    let result = client
      .execute(|| {
        let calls = calls.clone();
        async move {
          if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ApiFailure::RateLimited { retry_after: None, error: TestError("slow down") })
          } else {
            Ok(7)
          }
        }
      })
      .await;

    assert_eq!(result.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(client.state(), CallState::Succeeded);
  }

  #[tokio::test(start_paused = true)]
  async fn explicit_retry_after_is_honoured_verbatim() {
    let client = RateLimitedClient::new(600, fast_policy(2));
    let calls = Arc::new(AtomicU32::new(0));

    let start = Instant::now();
    client
      .execute(|| {
        let calls = calls.clone();
        async move {
          if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ApiFailure::RateLimited {
              retry_after: Some(Duration::from_secs(7)),
              error:       TestError("429"),
            })
          } else {
            Ok(())
          }
        }
      })
      .await
      .unwrap();

    // Not capped to max_delay (1 s) and not replaced by backoff (100 ms).
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_millis(7100));
  }

  #[tokio::test(start_paused = true)]
  async fn fatal_failures_are_not_retried() {
    let client = RateLimitedClient::new(600, fast_policy(5));
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = client
      .execute(|| {
        let calls = calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Err(ApiFailure::Fatal(TestError("invalid credentials")))
        }
      })
      .await;

    assert!(matches!(result, Err(CallError::Fatal(TestError("invalid credentials")))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), CallState::Failed);
  }

  #[tokio::test(start_paused = true)]
  async fn exhaustion_reports_attempts() {
    let client = RateLimitedClient::new(600, fast_policy(3));
    let calls = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = client
      .execute(|| {
        let calls = calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Err(ApiFailure::Transient(TestError("503")))
        }
      })
      .await;

    match result {
      Err(CallError::Exhausted { attempts, rate_limited, .. }) => {
        assert_eq!(attempts, 3);
        assert!(!rate_limited);
      }
      other => panic!("unexpected {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn cancellation_interrupts_backoff() {
    let cancel = CancellationToken::new();
    let client = RateLimitedClient::new(600, RetryPolicy {
      max_attempts: 5,
      base_delay:   Duration::from_secs(60),
      multiplier:   1.0,
      max_delay:    Duration::from_secs(60),
    })
    .with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_secs(1)).await;
      trigger.cancel();
    });

    let start = Instant::now();
    let result: Result<(), _> = client
      .execute(|| async { Err(ApiFailure::Transient(TestError("503"))) })
      .await;

    assert!(matches!(result, Err(CallError::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(60));
  }
}

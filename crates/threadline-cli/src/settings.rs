//! Runtime configuration (`config` crate).
//!
//! An optional TOML file layered under `THREADLINE_`-prefixed environment
//! variables (`THREADLINE_USER_ID`, `THREADLINE_MAIL__ACCESS_TOKEN`, …).

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::Context as _;
use serde::Deserialize;
use threadline_sync::{
  RetryPolicy, SyncOptions,
  chunk::{ChunkOptions, DEFAULT_CHUNK_SIZE, DEFAULT_YIELD_EVERY},
  dedup::DEFAULT_MAX_ATTACHMENT_BYTES,
  source::mail::{DEFAULT_BASE_URL, DEFAULT_PAGE_SIZE, DEFAULT_REQUESTS_PER_MINUTE},
};

// ─── Shapes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  #[serde(default = "default_store_path")]
  pub store_path:           PathBuf,
  #[serde(default = "default_attachment_root")]
  pub attachment_root:      PathBuf,
  #[serde(default = "default_user_id")]
  pub user_id:              String,
  #[serde(default = "default_max_attachment_bytes")]
  pub max_attachment_bytes: u64,
  #[serde(default = "default_chunk_size")]
  pub chunk_size:           usize,
  #[serde(default = "default_yield_every")]
  pub yield_every:          usize,
  /// JSON map of transaction id to assigned contacts.
  #[serde(default)]
  pub contacts_path:        Option<PathBuf>,
  #[serde(default)]
  pub messages:             Option<MessageDbConfig>,
  #[serde(default)]
  pub backup:               Option<BackupConfig>,
  #[serde(default)]
  pub mail:                 Option<MailConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDbConfig {
  pub path: PathBuf,
  /// Directory `~/` attachment paths resolve under; defaults to `$HOME`.
  #[serde(default)]
  pub home: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
  pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
  #[serde(default = "default_base_url")]
  pub base_url:            String,
  pub access_token:        String,
  #[serde(default = "default_requests_per_minute")]
  pub requests_per_minute: u32,
  #[serde(default = "default_page_size")]
  pub page_size:           u32,
  #[serde(default)]
  pub query:               Option<String>,
  #[serde(default)]
  pub retry:               RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts:  u32,
  pub base_delay_ms: u64,
  pub multiplier:    f64,
  pub max_delay_ms:  u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      max_attempts:  policy.max_attempts,
      base_delay_ms: policy.base_delay.as_millis() as u64,
      multiplier:    policy.multiplier,
      max_delay_ms:  policy.max_delay.as_millis() as u64,
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_attempts,
      base_delay:   Duration::from_millis(self.base_delay_ms),
      multiplier:   self.multiplier,
      max_delay:    Duration::from_millis(self.max_delay_ms),
    }
  }
}

fn default_store_path() -> PathBuf { PathBuf::from("~/.local/share/threadline/threadline.db") }
fn default_attachment_root() -> PathBuf { PathBuf::from("~/.local/share/threadline/attachments") }
fn default_user_id() -> String { "default".to_owned() }
fn default_max_attachment_bytes() -> u64 { DEFAULT_MAX_ATTACHMENT_BYTES }
fn default_chunk_size() -> usize { DEFAULT_CHUNK_SIZE }
fn default_yield_every() -> usize { DEFAULT_YIELD_EVERY }
fn default_base_url() -> String { DEFAULT_BASE_URL.to_owned() }
fn default_requests_per_minute() -> u32 { DEFAULT_REQUESTS_PER_MINUTE }
fn default_page_size() -> u32 { DEFAULT_PAGE_SIZE }

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Read `path` (if it exists) and the environment, then expand `~` in every
/// path.
pub fn load(path: &Path) -> anyhow::Result<AppConfig> { load_with_env(path, None) }

/// [`load`], reading `THREADLINE_*` variables from `env` instead of the
/// process environment when it is given.
fn load_with_env(path: &Path, env: Option<config::Map<String, String>>) -> anyhow::Result<AppConfig> {
  let settings = config::Config::builder()
    .add_source(config::File::from(path).required(false))
    .add_source(
      config::Environment::with_prefix("THREADLINE")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .source(env),
    )
    .build()
    .with_context(|| format!("failed to read config file {}", path.display()))?;

  let mut cfg: AppConfig = settings
    .try_deserialize()
    .context("failed to deserialise AppConfig")?;
  cfg.expand_paths();
  Ok(cfg)
}

impl AppConfig {
  fn expand_paths(&mut self) {
    self.store_path = expand_tilde(&self.store_path);
    self.attachment_root = expand_tilde(&self.attachment_root);
    self.contacts_path = self.contacts_path.as_deref().map(expand_tilde);
    if let Some(messages) = &mut self.messages {
      messages.path = expand_tilde(&messages.path);
      messages.home = messages.home.as_deref().map(expand_tilde);
    }
    if let Some(backup) = &mut self.backup {
      backup.path = expand_tilde(&backup.path);
    }
  }

  pub fn sync_options(&self, refresh_existing: bool) -> SyncOptions {
    let mut options = SyncOptions::new(self.user_id.clone(), self.attachment_root.clone());
    options.chunk = ChunkOptions {
      chunk_size: self.chunk_size,
      yield_every: self.yield_every,
      ..ChunkOptions::default()
    };
    options.refresh_existing = refresh_existing;
    options.max_attachment_bytes = self.max_attachment_bytes;
    options
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/") {
    if let Some(home) = home_dir() {
      return home.join(rest);
    }
  }
  path.to_path_buf()
}

pub fn home_dir() -> Option<PathBuf> { std::env::var_os("HOME").map(PathBuf::from) }

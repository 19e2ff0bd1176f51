//! `threadline`: import communications and link them to transactions.
//!
//! # Usage
//!
//! ```text
//! threadline --config ~/.config/threadline/threadline.toml sync
//! threadline sync --source mail --refresh
//! threadline autolink txn-42 --threads
//! threadline link communication:<uuid> txn-42
//! threadline unlink thread:messages-chat-chat123 txn-42
//! threadline threads --limit 10
//! ```

mod settings;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use settings::{AppConfig, home_dir};
use threadline_core::{
  contact::StaticContacts,
  link::{LinkSource, LinkTarget},
  record::SourceKind,
};
use threadline_store_sqlite::SqliteStore;
use threadline_sync::{
  AutoLinkEngine, LinkScope, RateLimitedClient, Source, SyncEngine, SyncProgress, SyncReport,
  SyncStatus, list_threads,
  source::{CredentialProvider, DeviceBackupSource, MailApiSource, MessageDbSource, StaticToken},
  sync_all,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "threadline", author, version, about = "Communication ingestion and transaction linking")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, global = true, default_value = "threadline.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Import from the configured sources.
  Sync {
    /// Limit to these sources (`messages`, `backup`, `mail`).
    #[arg(long = "source")]
    sources: Vec<SourceKind>,

    /// Overwrite communications that are already stored.
    #[arg(long)]
    refresh: bool,
  },

  /// Manually link a communication or thread to a transaction.
  Link {
    /// `communication:<uuid>`, `thread:<key>`, or a bare UUID.
    target:      LinkTarget,
    transaction: String,
  },

  /// Remove one link. The communication itself is kept.
  Unlink {
    target:      LinkTarget,
    transaction: String,
  },

  /// Link every communication involving the transaction's contacts.
  Autolink {
    transaction: String,

    /// Link whole threads instead of individual communications.
    #[arg(long)]
    threads: bool,
  },

  /// List threads, most recently active first.
  Threads {
    #[arg(long, default_value_t = 20)]
    limit: usize,
  },
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let cfg = settings::load(&cli.config)?;

  match cli.command {
    Command::Sync { sources, refresh } => sync(&cfg, &sources, refresh).await,
    Command::Link { target, transaction } => {
      let engine = AutoLinkEngine::new(open_store(&cfg).await?, StaticContacts::new());
      let link = engine.link(target, &transaction, LinkSource::Manual).await?;
      println!("{} -> {} ({})", link.target, link.transaction_id, link.link_source.as_str());
      Ok(())
    }
    Command::Unlink { target, transaction } => {
      let engine = AutoLinkEngine::new(open_store(&cfg).await?, StaticContacts::new());
      if engine.unlink(target.clone(), &transaction).await? {
        println!("unlinked {target} from {transaction}");
      } else {
        println!("{target} was not linked to {transaction}");
      }
      Ok(())
    }
    Command::Autolink { transaction, threads } => {
      let engine = AutoLinkEngine::new(open_store(&cfg).await?, load_contacts(&cfg)?);
      let scope = if threads { LinkScope::Threads } else { LinkScope::Communications };
      let report = engine.run(&cfg.user_id, &transaction, scope).await?;
      println!(
        "{transaction}: {} contacts, {} identifiers, {} matched, {} created, {} already linked",
        report.contacts, report.identifiers, report.matched, report.created, report.existing
      );
      Ok(())
    }
    Command::Threads { limit } => {
      let store = open_store(&cfg).await?;
      for thread in list_threads(&store, &cfg.user_id).await?.into_iter().take(limit) {
        let last = thread.last_activity.map(|t| t.to_rfc3339()).unwrap_or_default();
        let kind = if thread.is_group { "group" } else { "direct" };
        println!(
          "{}\t{kind}\t{} messages\t{last}\t{}",
          thread.thread_key,
          thread.message_count,
          thread.participants_flat()
        );
      }
      Ok(())
    }
  }
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn sync(cfg: &AppConfig, only: &[SourceKind], refresh: bool) -> anyhow::Result<()> {
  let store = open_store(cfg).await?;
  let cancel = CancellationToken::new();
  let sources = open_sources(cfg, only, &cancel).await?;
  if sources.is_empty() {
    bail!("no source could be opened; check the [messages], [backup] and [mail] sections");
  }

  let token = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::warn!("interrupted; stopping after the current chunk");
      token.cancel();
    }
  });

  let (tx, mut rx) = watch::channel(SyncProgress::fetching(0));
  tokio::spawn(async move {
    while rx.changed().await.is_ok() {
      let p = *rx.borrow_and_update();
      tracing::debug!(phase = ?p.phase, current = p.current, total = p.total, "sync progress");
    }
  });

  let engine = SyncEngine::new(store);
  let reports = sync_all(&engine, &sources, &cfg.sync_options(refresh), &tx, &cancel).await;
  reports.iter().for_each(print_report);

  let failed = reports
    .iter()
    .filter(|r| matches!(r.status, SyncStatus::Failed { .. }))
    .count();
  if failed > 0 {
    bail!("{failed} of {} sources failed", reports.len());
  }
  Ok(())
}

fn print_report(r: &SyncReport) {
  println!(
    "{}: {} | inserted {} updated {} duplicates {} | attachments {} stored {} reused {} oversized {} failed | {} empty bodies, {} pages",
    r.source,
    r.status,
    r.inserted,
    r.updated,
    r.skipped_duplicates,
    r.attachments_stored,
    r.attachments_deduplicated,
    r.skipped_oversized,
    r.failed_attachments,
    r.empty_bodies,
    r.pages,
  );
}

// ─── Wiring ──────────────────────────────────────────────────────────────────

async fn open_store(cfg: &AppConfig) -> anyhow::Result<SqliteStore> {
  if let Some(parent) = cfg.store_path.parent() {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {}", parent.display()))?;
  }
  SqliteStore::open(&cfg.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", cfg.store_path))
}

fn load_contacts(cfg: &AppConfig) -> anyhow::Result<StaticContacts> {
  let path = cfg
    .contacts_path
    .as_ref()
    .context("contacts_path is not configured")?;
  let raw = std::fs::read_to_string(path)
    .with_context(|| format!("reading contacts file {}", path.display()))?;
  StaticContacts::from_json(&raw).context("parsing contacts file")
}

/// Open each configured (and requested) source. A source that cannot be
/// opened is logged and left out; the others still run.
async fn open_sources(
  cfg: &AppConfig,
  only: &[SourceKind],
  cancel: &CancellationToken,
) -> anyhow::Result<Vec<Source>> {
  let wanted = |kind: SourceKind| only.is_empty() || only.contains(&kind);
  let mut sources = Vec::new();

  for kind in only {
    let configured = match kind {
      SourceKind::Messages => cfg.messages.is_some(),
      SourceKind::Backup => cfg.backup.is_some(),
      SourceKind::Mail => cfg.mail.is_some(),
    };
    if !configured {
      tracing::warn!(source = %kind, "requested source is not configured");
    }
  }

  if let Some(messages) = cfg.messages.as_ref().filter(|_| wanted(SourceKind::Messages)) {
    let home = messages.home.clone().or_else(home_dir).unwrap_or_default();
    match MessageDbSource::open(&messages.path, home).await {
      Ok(source) => sources.push(Source::Messages(source)),
      Err(error) => tracing::warn!(source = "messages", %error, "source unavailable; skipped"),
    }
  }

  if let Some(backup) = cfg.backup.as_ref().filter(|_| wanted(SourceKind::Backup)) {
    match DeviceBackupSource::open(backup.path.clone()).await {
      Ok(source) => sources.push(Source::Backup(source)),
      Err(error) => tracing::warn!(source = "backup", %error, "source unavailable; skipped"),
    }
  }

  if let Some(mail) = cfg.mail.as_ref().filter(|_| wanted(SourceKind::Mail)) {
    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticToken::new(mail.access_token.clone()));
    let client = RateLimitedClient::new(mail.requests_per_minute, mail.retry.policy())
      .with_cancellation(cancel.clone());
    let mut source = MailApiSource::new(mail.base_url.clone(), credentials, client)
      .context("failed to build mailbox client")?
      .with_page_size(mail.page_size);
    if let Some(query) = &mail.query {
      source = source.with_query(query.clone());
    }
    sources.push(Source::Mail(source));
  }

  Ok(sources)
}

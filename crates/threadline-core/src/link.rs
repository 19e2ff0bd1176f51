//! Links between communications (or whole threads) and business
//! transactions.
//!
//! A link targets exactly one of a communication or a thread; the
//! [`LinkTarget`] enum makes the exclusivity structural. At most one link
//! exists per `(target, transaction_id)`, enforced by unique indexes in the
//! datastore rather than by application checks.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

// ─── Target ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LinkTarget {
  Communication(Uuid),
  Thread(String),
}

impl fmt::Display for LinkTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Communication(id) => write!(f, "communication:{id}"),
      Self::Thread(key) => write!(f, "thread:{key}"),
    }
  }
}

impl FromStr for LinkTarget {
  type Err = Error;

  /// Parses the `communication:<uuid>` / `thread:<key>` form produced by
  /// `Display`. A bare UUID is read as a communication.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Some(rest) = s.strip_prefix("communication:") {
      return Uuid::parse_str(rest)
        .map(Self::Communication)
        .map_err(|_| Error::MalformedLinkTarget(s.to_owned()));
    }
    if let Some(rest) = s.strip_prefix("thread:") {
      if rest.is_empty() {
        return Err(Error::MalformedLinkTarget(s.to_owned()));
      }
      return Ok(Self::Thread(rest.to_owned()));
    }
    Uuid::parse_str(s)
      .map(Self::Communication)
      .map_err(|_| Error::MalformedLinkTarget(s.to_owned()))
  }
}

// ─── Provenance ──────────────────────────────────────────────────────────────

/// Whether a link was created by the matcher or by a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkSource {
  Auto,
  Manual,
}

impl LinkSource {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Auto => "auto",
      Self::Manual => "manual",
    }
  }
}

impl FromStr for LinkSource {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "auto" => Ok(Self::Auto),
      "manual" => Ok(Self::Manual),
      other => Err(Error::UnknownLinkSource(other.to_owned())),
    }
  }
}

// ─── LinkRecord ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
  pub link_id:        Uuid,
  pub target:         LinkTarget,
  pub transaction_id: String,
  pub link_source:    LinkSource,
  pub linked_at:      DateTime<Utc>,
}

impl LinkRecord {
  /// A fresh link stamped with the current time.
  pub fn new(
    target: LinkTarget,
    transaction_id: impl Into<String>,
    link_source: LinkSource,
  ) -> Self {
    Self {
      link_id: Uuid::new_v4(),
      target,
      transaction_id: transaction_id.into(),
      link_source,
      linked_at: Utc::now(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn target_display_parses_back() {
    let id = Uuid::new_v4();
    let comm = LinkTarget::Communication(id);
    assert_eq!(comm.to_string().parse::<LinkTarget>().unwrap(), comm);

    let thread = LinkTarget::Thread("mail-chat-17a".into());
    assert_eq!(thread.to_string().parse::<LinkTarget>().unwrap(), thread);
  }

  #[test]
  fn bare_uuid_is_a_communication() {
    let id = Uuid::new_v4();
    assert_eq!(
      id.to_string().parse::<LinkTarget>().unwrap(),
      LinkTarget::Communication(id)
    );
    assert!("thread:".parse::<LinkTarget>().is_err());
    assert!("nonsense".parse::<LinkTarget>().is_err());
  }
}

//! Contacts: read-only input to transaction matching.
//!
//! Contacts live in an external registry; threadline never writes them. The
//! [`ContactRegistry`] trait is the seam, and [`StaticContacts`] is an
//! in-memory implementation loadable from JSON.

use std::{collections::BTreeSet, collections::HashMap, convert::Infallible, future::Future};

use serde::{Deserialize, Serialize};

use crate::identity::normalize_all;

/// A contact assigned to a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
  pub contact_id:    String,
  #[serde(default)]
  pub phone_numbers: Vec<String>,
  #[serde(default)]
  pub emails:        Vec<String>,
}

impl Contact {
  /// Every normalized phone and email identifier for this contact.
  pub fn identifiers(&self) -> BTreeSet<String> {
    normalize_all(
      self
        .phone_numbers
        .iter()
        .chain(self.emails.iter())
        .map(String::as_str),
    )
  }
}

/// Read-only lookup of the contacts assigned to a transaction.
pub trait ContactRegistry: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn contacts_for_transaction<'a>(
    &'a self,
    transaction_id: &'a str,
  ) -> impl Future<Output = Result<Vec<Contact>, Self::Error>> + Send + 'a;
}

// ─── In-memory registry ──────────────────────────────────────────────────────

/// Transaction id → assigned contacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticContacts {
  assignments: HashMap<String, Vec<Contact>>,
}

impl StaticContacts {
  pub fn new() -> Self { Self::default() }

  pub fn assign(&mut self, transaction_id: impl Into<String>, contact: Contact) {
    self
      .assignments
      .entry(transaction_id.into())
      .or_default()
      .push(contact);
  }

  /// Parse `{"<transaction id>": [<contact>, ...], ...}`.
  pub fn from_json(raw: &str) -> crate::Result<Self> { Ok(serde_json::from_str(raw)?) }
}

impl ContactRegistry for StaticContacts {
  type Error = Infallible;

  async fn contacts_for_transaction(
    &self,
    transaction_id: &str,
  ) -> Result<Vec<Contact>, Infallible> {
    Ok(
      self
        .assignments
        .get(transaction_id)
        .cloned()
        .unwrap_or_default(),
    )
  }
}

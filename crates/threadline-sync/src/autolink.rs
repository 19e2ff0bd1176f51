//! Transaction auto-linking.
//!
//! A transaction's contacts become a set of normalized identifiers. Every
//! stored communication whose thread-wide `participants_flat` shares an
//! identifier with that set gets an `auto` link. Uniqueness of
//! `(target, transaction)` lives in the datastore, so re-runs are no-ops and
//! existing manual links are left exactly as they are.

use std::collections::{BTreeSet, HashSet};

use threadline_core::{
  contact::{Contact, ContactRegistry},
  link::{LinkRecord, LinkSource, LinkTarget},
  store::CommunicationStore,
  thread::parse_participants_flat,
};

use crate::{Error, Result};

/// What an auto-link run attaches the transaction to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkScope {
  /// One link per matching communication.
  #[default]
  Communications,
  /// One link per thread containing a matching communication.
  Threads,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoLinkReport {
  pub contacts:    usize,
  pub identifiers: usize,
  /// Targets whose participants intersect the contact identifiers.
  pub matched:     usize,
  pub created:     usize,
  /// Matched targets that already had a link (auto or manual).
  pub existing:    usize,
}

pub struct AutoLinkEngine<S, C> {
  store:    S,
  contacts: C,
}

impl<S, C> AutoLinkEngine<S, C>
where
  S: CommunicationStore,
  C: ContactRegistry,
{
  pub fn new(store: S, contacts: C) -> Self { Self { store, contacts } }

  pub fn store(&self) -> &S { &self.store }

  /// Link every communication (or thread) of `user_id` involving one of
  /// the transaction's contacts.
  pub async fn run(
    &self,
    user_id: &str,
    transaction_id: &str,
    scope: LinkScope,
  ) -> Result<AutoLinkReport> {
    let contacts = self
      .contacts
      .contacts_for_transaction(transaction_id)
      .await
      .map_err(|e| Error::Contacts(Box::new(e)))?;

    let identifiers: BTreeSet<String> = contacts.iter().flat_map(Contact::identifiers).collect();
    let mut report = AutoLinkReport {
      contacts: contacts.len(),
      identifiers: identifiers.len(),
      ..AutoLinkReport::default()
    };
    if identifiers.is_empty() {
      tracing::info!(transaction = transaction_id, "no contact identifiers; nothing to link");
      return Ok(report);
    }

    let candidates = self
      .store
      .candidates_for_identifiers(user_id, identifiers.iter().cloned().collect())
      .await
      .map_err(Error::storage)?;

    let mut targets = Vec::new();
    let mut threads = HashSet::new();
    for candidate in candidates {
      // The store only prefilters; a substring hit is not a match.
      if parse_participants_flat(&candidate.participants_flat).is_disjoint(&identifiers) {
        continue;
      }
      match scope {
        LinkScope::Communications => targets.push(LinkTarget::Communication(candidate.id)),
        LinkScope::Threads => {
          if threads.insert(candidate.thread_id.clone()) {
            targets.push(LinkTarget::Thread(candidate.thread_id));
          }
        }
      }
    }
    report.matched = targets.len();

    for target in targets {
      let link = LinkRecord::new(target, transaction_id, LinkSource::Auto);
      if self.store.insert_link_if_absent(link).await.map_err(Error::storage)? {
        report.created += 1;
      } else {
        report.existing += 1;
      }
    }

    tracing::info!(
      transaction = transaction_id,
      ?scope,
      matched = report.matched,
      created = report.created,
      existing = report.existing,
      "auto-link run complete"
    );
    Ok(report)
  }

  /// Link `target` to a transaction.
  ///
  /// A manual link replaces the provenance of an existing auto link. An auto
  /// link never changes an existing one; the stored link is returned.
  pub async fn link(
    &self,
    target: LinkTarget,
    transaction_id: &str,
    source: LinkSource,
  ) -> Result<LinkRecord> {
    match source {
      LinkSource::Manual => self
        .store
        .upsert_manual_link(target, transaction_id)
        .await
        .map_err(Error::storage),
      LinkSource::Auto => {
        let link = LinkRecord::new(target, transaction_id, LinkSource::Auto);
        if self.store.insert_link_if_absent(link.clone()).await.map_err(Error::storage)? {
          return Ok(link);
        }
        let existing = self
          .store
          .links_for_transaction(transaction_id)
          .await
          .map_err(Error::storage)?
          .into_iter()
          .find(|l| l.target == link.target);
        Ok(existing.unwrap_or(link))
      }
    }
  }

  /// Remove exactly the link between `target` and the transaction.
  pub async fn unlink(&self, target: LinkTarget, transaction_id: &str) -> Result<bool> {
    let removed = self
      .store
      .delete_link(target.clone(), transaction_id)
      .await
      .map_err(Error::storage)?;
    tracing::debug!(%target, transaction = transaction_id, removed, "unlink");
    Ok(removed)
  }
}

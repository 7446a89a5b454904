//! What a transaction asks the storage and the catalog to do, and what it
//! did.
//!
//! The database collects its pending key sets and resource changes into a
//! [`TransactionCommand`]; the backend writes and commits the files, then
//! the catalog applies the document edits. Each step reports into a
//! [`TransactionReport`].
use std::collections::BTreeSet;

use chrono::{DateTime, FixedOffset};

use crate::datatype::CatalogValues;

pub const DEFAULT_MESSAGE: &str = "no comment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self { name: name.into(), email: email.into() }
    }
}

/// Who, when and why, as recorded by the commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitInfo {
    /// Defaults to the committer.
    pub author: Option<Author>,
    /// Defaults to now.
    pub date: Option<DateTime<FixedOffset>>,
    pub message: Option<String>,
}

impl CommitInfo {
    pub fn message(message: impl Into<String>) -> Self {
        Self { message: Some(message.into()), ..Self::default() }
    }
    pub fn message_or_default(&self) -> &str {
        match self.message.as_deref() {
            Some(message) if !message.is_empty() => message,
            _ => DEFAULT_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionCommand {
    pub info: CommitInfo,
    pub added: BTreeSet<String>,
    pub changed: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub docs_to_unindex: BTreeSet<String>,
    pub docs_to_index: Vec<CatalogValues>,
}

impl TransactionCommand {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.docs_to_unindex.is_empty()
            && self.docs_to_index.is_empty()
    }

    /// Keys whose bytes must be written, in order.
    pub fn keys_to_write(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.changed.iter())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionReport {
    /// The new commit, for backends keeping a history.
    pub commit: Option<String>,
    pub written: usize,
    pub removed: usize,
    pub indexed: usize,
    pub unindexed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_falls_back() {
        assert_eq!(CommitInfo::default().message_or_default(), "no comment");
        assert_eq!(CommitInfo::message("").message_or_default(), "no comment");
        assert_eq!(CommitInfo::message("fix").message_or_default(), "fix");
    }
}

//! A `DomainService` over an in-memory snapshot of items and threads.
//!
//! Snapshots are plain JSON (`{"items": [...], "threads": [...]}`), so a
//! mailbox export can be replayed against the engine without any of the
//! live Gmail/Calendar/Slack integrations.

use std::path::Path;

use futures::future::BoxFuture;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SiftError};
use crate::traits::DomainService;
use crate::types::{Item, KeywordQuery, MetadataCriteria, Thread};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailboxSnapshot {
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub threads: Vec<Thread>,
}

impl MailboxSnapshot {
    pub fn new(items: Vec<Item>, threads: Vec<Thread>) -> Self {
        Self { items, threads }
    }

    /// Load a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Pure filtering behind `filter_by_metadata`.
    pub fn filter(&self, criteria: &MetadataCriteria) -> Vec<Item> {
        let sender = criteria.sender.as_ref().map(|s| s.to_lowercase());
        let mut matched: Vec<Item> = self
            .items
            .iter()
            .filter(|item| criteria.source.map_or(true, |s| item.source == s))
            .filter(|item| match &sender {
                Some(wanted) => item
                    .sender
                    .as_ref()
                    .is_some_and(|s| s.to_lowercase().contains(wanted.as_str())),
                None => true,
            })
            .filter(|item| criteria.after.map_or(true, |t| item.timestamp >= t))
            .filter(|item| criteria.before.map_or(true, |t| item.timestamp < t))
            .filter(|item| {
                criteria.labels.iter().all(|label| {
                    item.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
                })
            })
            .filter(|item| criteria.unread.map_or(true, |u| item.unread == u))
            .cloned()
            .collect();

        newest_first(&mut matched, criteria.limit);
        matched
    }

    /// Pure matching behind `search_by_keyword`.
    pub fn search(&self, query: &KeywordQuery) -> Result<Vec<Item>> {
        let pattern = RegexBuilder::new(&regex::escape(query.query.trim()))
            .case_insensitive(true)
            .build()
            .map_err(|e| SiftError::Domain(format!("invalid keyword query: {}", e)))?;

        let mut matched: Vec<Item> = self
            .items
            .iter()
            .filter(|item| query.source.map_or(true, |s| item.source == s))
            .filter(|item| {
                [&item.subject, &item.snippet, &item.body]
                    .into_iter()
                    .flatten()
                    .any(|text| pattern.is_match(text))
            })
            .cloned()
            .collect();

        newest_first(&mut matched, query.limit);
        Ok(matched)
    }

    /// Threads for the given ids, in request order. Ids without a stored
    /// thread are assembled from items carrying that `thread_id`; unknown
    /// ids are omitted.
    pub fn threads_for(&self, ids: &[String]) -> Vec<Thread> {
        ids.iter()
            .filter_map(|id| {
                if let Some(thread) = self.threads.iter().find(|t| &t.id == id) {
                    return Some(thread.clone());
                }
                let mut messages: Vec<Item> = self
                    .items
                    .iter()
                    .filter(|i| i.thread_id.as_deref() == Some(id.as_str()))
                    .cloned()
                    .collect();
                if messages.is_empty() {
                    return None;
                }
                messages.sort_by_key(|m| m.timestamp);
                Some(Thread {
                    id: id.clone(),
                    subject: messages.first().and_then(|m| m.subject.clone()),
                    messages,
                })
            })
            .collect()
    }
}

fn newest_first(items: &mut Vec<Item>, limit: Option<usize>) {
    items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
    if let Some(limit) = limit {
        items.truncate(limit);
    }
}

impl DomainService for MailboxSnapshot {
    fn filter_by_metadata(&self, criteria: MetadataCriteria) -> BoxFuture<'_, Result<Vec<Item>>> {
        Box::pin(async move {
            let items = self.filter(&criteria);
            debug!(matched = items.len(), "Snapshot metadata filter");
            Ok(items)
        })
    }

    fn search_by_keyword(&self, query: KeywordQuery) -> BoxFuture<'_, Result<Vec<Item>>> {
        Box::pin(async move { self.search(&query) })
    }

    fn read_threads_batch(&self, ids: Vec<String>) -> BoxFuture<'_, Result<Vec<Thread>>> {
        Box::pin(async move { Ok(self.threads_for(&ids)) })
    }
}

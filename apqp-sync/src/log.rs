//! Sync Log queries: newest-first pages, restartable from any sequence number.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use apqp_core::types::{Direction, ProjectKey, SyncLogEntry, SyncOutcome};

use crate::error::StorageError;
use crate::store::{LogFilter, NamespaceStore};

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub project_key: ProjectKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SyncOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Continue below this sequence number (the `next` of a previous page).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<u64>,
}

fn default_limit() -> usize {
    DEFAULT_PAGE_SIZE
}

impl LogQuery {
    pub fn new(project_key: ProjectKey) -> Self {
        Self {
            project_key,
            direction: None,
            outcome: None,
            since: None,
            limit: DEFAULT_PAGE_SIZE,
            before: None,
        }
    }

    pub fn filter(&self) -> LogFilter {
        LogFilter {
            direction: self.direction,
            outcome: self.outcome,
            since: self.since,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub entries: Vec<SyncLogEntry>,
    /// Pass as `before` to fetch the following page; `None` on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<u64>,
}

/// Fetch one page. Reads one entry past `limit` to know whether more exist.
pub fn query_page<S: NamespaceStore + ?Sized>(
    store: &S,
    query: &LogQuery,
) -> Result<LogPage, StorageError> {
    let limit = query.limit.max(1);
    let mut entries = store.query_log(
        &query.project_key,
        &query.filter(),
        query.before,
        limit.saturating_add(1),
    )?;
    let next = if entries.len() > limit {
        entries.truncate(limit);
        entries.last().map(|entry| entry.seq)
    } else {
        None
    };
    Ok(LogPage { entries, next })
}

/// Lazy sequence of pages. Nothing is read until the first `next()`.
pub struct LogPages<'a, S: ?Sized> {
    store: &'a S,
    query: LogQuery,
    done: bool,
}

impl<'a, S: NamespaceStore + ?Sized> LogPages<'a, S> {
    pub fn new(store: &'a S, query: LogQuery) -> Self {
        Self {
            store,
            query,
            done: false,
        }
    }

    /// Where the next page would start; feed it back into a fresh
    /// [`LogQuery::before`] to resume later.
    pub fn cursor(&self) -> Option<u64> {
        self.query.before
    }
}

impl<S: NamespaceStore + ?Sized> Iterator for LogPages<'_, S> {
    type Item = Result<Vec<SyncLogEntry>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match query_page(self.store, &self.query) {
            Ok(page) => {
                match page.next {
                    Some(next) => self.query.before = Some(next),
                    None => self.done = true,
                }
                if page.entries.is_empty() {
                    None
                } else {
                    Some(Ok(page.entries))
                }
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

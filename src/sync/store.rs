use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::ingest::convert::CanonicalEvent;
use crate::ingest::types::EventSource;
use crate::sync::types::SyncStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// A persisted event plus the number of users attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub event: CanonicalEvent,
    pub member_count: u32,
}

/// Persistence collaborator. Keyed by `(source, source_id)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn exists(&self, source: EventSource, source_id: &str) -> Result<bool>;

    /// Insert or replace by key. Member attachments survive replacement.
    async fn upsert(&self, event: &CanonicalEvent) -> Result<UpsertOutcome>;

    /// Active events with `from <= start_time <= to`, earliest first.
    async fn active_starting_between(
        &self,
        source: EventSource,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<CanonicalEvent>>;

    /// Events whose `end_time` is strictly before `cutoff`, any status.
    async fn ended_before(
        &self,
        source: EventSource,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>>;

    async fn set_status(
        &self,
        source: EventSource,
        source_id: &str,
        status: SyncStatus,
    ) -> Result<()>;
}

type Key = (EventSource, String);

/// Process-local store used by the binary and the tests.
#[derive(Default)]
pub struct InMemoryEventStore {
    rows: Mutex<BTreeMap<Key, StoredEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, event: CanonicalEvent, member_count: u32) {
        let key = (event.source, event.source_id.clone());
        self.rows.lock().insert(
            key,
            StoredEvent {
                event,
                member_count,
            },
        );
    }

    pub fn add_member(&self, source: EventSource, source_id: &str) -> Result<u32> {
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(&(source, source_id.to_string()))
            .ok_or_else(|| anyhow!("no event {source}:{source_id}"))?;
        row.member_count += 1;
        Ok(row.member_count)
    }

    pub fn get(&self, source: EventSource, source_id: &str) -> Option<StoredEvent> {
        self.rows
            .lock()
            .get(&(source, source_id.to_string()))
            .cloned()
    }

    pub fn all(&self) -> Vec<StoredEvent> {
        self.rows.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn exists(&self, source: EventSource, source_id: &str) -> Result<bool> {
        Ok(self
            .rows
            .lock()
            .contains_key(&(source, source_id.to_string())))
    }

    async fn upsert(&self, event: &CanonicalEvent) -> Result<UpsertOutcome> {
        let mut rows = self.rows.lock();
        let key = (event.source, event.source_id.clone());
        match rows.get_mut(&key) {
            Some(row) => {
                row.event = event.clone();
                Ok(UpsertOutcome::Updated)
            }
            None => {
                rows.insert(
                    key,
                    StoredEvent {
                        event: event.clone(),
                        member_count: 0,
                    },
                );
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn active_starting_between(
        &self,
        source: EventSource,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<CanonicalEvent>> {
        let mut out: Vec<CanonicalEvent> = self
            .rows
            .lock()
            .values()
            .filter(|r| {
                r.event.source == source
                    && r.event.sync_status == SyncStatus::Active
                    && r.event.start_time >= from
                    && r.event.start_time <= to
            })
            .map(|r| r.event.clone())
            .collect();
        out.sort_by_key(|e| e.start_time);
        if let Some(n) = limit {
            out.truncate(n);
        }
        Ok(out)
    }

    async fn ended_before(
        &self,
        source: EventSource,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|r| {
                r.event.source == source && r.event.end_time.is_some_and(|end| end < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn set_status(
        &self,
        source: EventSource,
        source_id: &str,
        status: SyncStatus,
    ) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(&(source, source_id.to_string()))
            .ok_or_else(|| anyhow!("no event {source}:{source_id}"))?;
        row.event.sync_status = status;
        Ok(())
    }
}

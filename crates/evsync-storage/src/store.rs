use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use evsync_core::{Event, EventRecord};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertOutcome {
    pub fn merge(self, other: UpsertOutcome) -> UpsertOutcome {
        UpsertOutcome {
            inserted: self.inserted + other.inserted,
            updated: self.updated + other.updated,
        }
    }
}

/// Keyed writes and scans over persisted events.
///
/// Both upserts update only `guest_count` on conflict (keeping the larger
/// value); title, description and category of an existing row never change.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Upsert keyed on `external_id`. Events without one are rejected.
    async fn upsert_by_external_id(&self, events: &[Event]) -> anyhow::Result<UpsertOutcome>;
    /// Upsert keyed on `(title, start_time)` among rows without an external id.
    async fn upsert_by_composite_key(&self, events: &[Event]) -> anyhow::Result<UpsertOutcome>;
    /// Every stored event ordered by ascending `start_time`.
    async fn all_events(&self) -> anyhow::Result<Vec<EventRecord>>;
    /// Identity keys (external id, else composite) of every stored event.
    async fn existing_keys(&self) -> anyhow::Result<HashSet<String>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// In-process store used for `--dry-run` syncs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: Mutex<Vec<EventRecord>>,
    settings: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_from(event: &Event) -> EventRecord {
        let now = Utc::now();
        EventRecord {
            id: Uuid::new_v4(),
            external_id: event.external_id.clone(),
            title: event.title.clone(),
            description: event.description.clone(),
            start_time: event.start_time,
            guest_count: event.guest_count,
            category: event.category.label().to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn merge_into(rows: &mut Vec<EventRecord>, event: &Event, position: Option<usize>) -> UpsertOutcome {
        match position {
            Some(idx) => {
                let row = &mut rows[idx];
                row.guest_count = row.guest_count.max(event.guest_count);
                row.updated_at = Utc::now();
                UpsertOutcome { inserted: 0, updated: 1 }
            }
            None => {
                rows.push(Self::record_from(event));
                UpsertOutcome { inserted: 1, updated: 0 }
            }
        }
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn upsert_by_external_id(&self, events: &[Event]) -> anyhow::Result<UpsertOutcome> {
        let mut rows = self.events.lock().await;
        let mut outcome = UpsertOutcome::default();
        for event in events {
            let Some(external_id) = event.external_id.as_deref() else {
                anyhow::bail!("event {:?} has no external id", event.title);
            };
            let position = rows
                .iter()
                .position(|r| r.external_id.as_deref() == Some(external_id));
            outcome = outcome.merge(Self::merge_into(&mut rows, event, position));
        }
        Ok(outcome)
    }

    async fn upsert_by_composite_key(&self, events: &[Event]) -> anyhow::Result<UpsertOutcome> {
        let mut rows = self.events.lock().await;
        let mut outcome = UpsertOutcome::default();
        for event in events {
            let position = rows.iter().position(|r| {
                r.external_id.is_none() && r.title == event.title && r.start_time == event.start_time
            });
            outcome = outcome.merge(Self::merge_into(&mut rows, event, position));
        }
        Ok(outcome)
    }

    async fn all_events(&self) -> anyhow::Result<Vec<EventRecord>> {
        let mut rows = self.events.lock().await.clone();
        rows.sort_by_key(|r| r.start_time);
        Ok(rows)
    }

    async fn existing_keys(&self) -> anyhow::Result<HashSet<String>> {
        Ok(self
            .events
            .lock()
            .await
            .iter()
            .map(|r| r.identity_key().to_string())
            .collect())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.settings.lock().await.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.settings
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

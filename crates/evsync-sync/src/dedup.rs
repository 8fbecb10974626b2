use std::collections::HashMap;
use std::sync::Arc;

use evsync_core::Event;
use evsync_storage::{EventStore, UpsertOutcome};
use tracing::debug;

/// Collapse candidates sharing `(title, start_time)`, keeping the one with the
/// larger `guest_count`. Ties keep the first seen; output keeps first-seen order.
pub fn collapse_candidates(events: Vec<Event>) -> Vec<Event> {
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(events.len());
    let mut kept: Vec<Event> = Vec::with_capacity(events.len());

    for event in events {
        match slots.get(&event.composite_key()) {
            Some(&idx) => {
                if event.guest_count > kept[idx].guest_count {
                    kept[idx] = event;
                }
            }
            None => {
                slots.insert(event.composite_key(), kept.len());
                kept.push(event);
            }
        }
    }
    kept
}

/// Merges fetched events into the event store.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn EventStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, events: Vec<Event>) -> anyhow::Result<UpsertOutcome> {
        let candidates = collapse_candidates(events);
        let (with_id, without_id): (Vec<Event>, Vec<Event>) = candidates
            .into_iter()
            .partition(|e| e.external_id.is_some());

        let mut outcome = UpsertOutcome::default();
        if !with_id.is_empty() {
            outcome = outcome.merge(self.store.upsert_by_external_id(&with_id).await?);
        }
        if !without_id.is_empty() {
            outcome = outcome.merge(self.store.upsert_by_composite_key(&without_id).await?);
        }
        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            "upsert complete"
        );
        Ok(outcome)
    }
}
